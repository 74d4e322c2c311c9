/// Control-plane route semantics - defines only paths, not transport.
/// Keeps the worker and the CLI agreeing on the grader API surface.

pub const GRADER_PREFIX: &str = "/api/grader";

/// `GET` - pending submissions for one architecture (`?arch=`)
pub fn submissions_path() -> String {
    format!("{}/submissions", GRADER_PREFIX)
}

/// `POST` - claim exclusive grading rights; 409 when another worker won
pub fn claim_path(id: u64) -> String {
    format!("{}/submissions/{}/claim", GRADER_PREFIX, id)
}

/// `POST` - release a held claim back to the waiting pool
pub fn cancel_path(id: u64) -> String {
    format!("{}/submissions/{}/cancel", GRADER_PREFIX, id)
}

/// `GET` - raw (gzip) archive body
pub fn tarball_path(id: u64) -> String {
    format!("{}/submissions/{}/tarball", GRADER_PREFIX, id)
}

/// `POST` - multipart verdict upload
pub fn result_path(id: u64) -> String {
    format!("{}/submissions/{}/result", GRADER_PREFIX, id)
}

/// `GET` - liveness ping while a job is in flight
pub fn heartbeat_path() -> String {
    format!("{}/grading", GRADER_PREFIX)
}

/// Form value the result endpoint expects for the `passed` field
pub fn passed_form_value(passed: bool) -> &'static str {
    if passed {
        "true"
    } else {
        "false"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_paths() {
        assert_eq!(submissions_path(), "/api/grader/submissions");
        assert_eq!(claim_path(42), "/api/grader/submissions/42/claim");
        assert_eq!(cancel_path(42), "/api/grader/submissions/42/cancel");
        assert_eq!(tarball_path(7), "/api/grader/submissions/7/tarball");
        assert_eq!(result_path(7), "/api/grader/submissions/7/result");
    }

    #[test]
    fn test_heartbeat_path() {
        assert_eq!(heartbeat_path(), "/api/grader/grading");
    }

    #[test]
    fn test_passed_form_value() {
        assert_eq!(passed_form_value(true), "true");
        assert_eq!(passed_form_value(false), "false");
    }
}
