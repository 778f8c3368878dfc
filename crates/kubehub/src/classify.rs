//! Maps kube-rs errors onto the store error taxonomy.

use std::error::Error as StdError;
use std::io::ErrorKind;

use colony_core::StoreError;
use kube::error::ErrorResponse;

/// Classify a kube client error for the object described by `what`.
pub fn classify(err: &kube::Error, what: &str) -> StoreError {
    match err {
        kube::Error::Api(resp) => from_response(resp, what),
        other if is_network_error(other) => StoreError::Transient(format!("{}: {}", what, other)),
        other => StoreError::Client(format!("{}: {}", what, other)),
    }
}

/// Classify an arbitrary error by looking for a kube error (or API status) in its source chain.
pub fn classify_dyn(err: &(dyn StdError + 'static), what: &str) -> StoreError {
    let mut cur: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = cur {
        if let Some(k) = e.downcast_ref::<kube::Error>() {
            return classify(k, what);
        }
        if let Some(resp) = e.downcast_ref::<ErrorResponse>() {
            return from_response(resp, what);
        }
        cur = e.source();
    }
    if is_network_error(err) {
        StoreError::Transient(format!("{}: {}", what, err))
    } else {
        StoreError::Client(format!("{}: {}", what, err))
    }
}

pub fn from_response(resp: &ErrorResponse, what: &str) -> StoreError {
    match (resp.code, resp.reason.as_str()) {
        (409, "AlreadyExists") => StoreError::AlreadyExists(what.to_string()),
        (409, _) => StoreError::Conflict(what.to_string()),
        (404, _) => StoreError::NotFound(what.to_string()),
        (_, "ServiceUnavailable" | "Timeout" | "ServerTimeout" | "TooManyRequests") | (429 | 503 | 504, _) => {
            StoreError::Transient(format!("{}: {}", what, resp.message))
        }
        (401 | 403, _) => StoreError::Forbidden(format!("{}: {}", what, resp.message)),
        (400 | 422, _) => StoreError::Invalid(format!("{}: {}", what, resp.message)),
        (code, _) => StoreError::Api { code, message: format!("{}: {}", what, resp.message) },
    }
}

/// Connection refused/reset/aborted and timeouts anywhere in the source chain.
///
/// These show up while the cluster is starting or the network path is not ready;
/// callers decide whether to retry.
pub fn is_network_error(err: &(dyn StdError + 'static)) -> bool {
    let mut cur: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = cur {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::TimedOut
            ) {
                return true;
            }
        }
        if e.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return true;
        }
        cur = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(code: u16, reason: &str) -> ErrorResponse {
        ErrorResponse { status: "Failure".into(), message: "boom".into(), reason: reason.into(), code }
    }

    #[test]
    fn api_statuses_map_to_taxonomy() {
        assert!(from_response(&resp(409, "AlreadyExists"), "x").is_already_exists());
        assert!(from_response(&resp(409, "Conflict"), "x").is_conflict());
        assert!(from_response(&resp(404, "NotFound"), "x").is_not_found());
        assert!(from_response(&resp(503, "ServiceUnavailable"), "x").is_transient());
        assert!(from_response(&resp(504, ""), "x").is_transient());
        assert!(from_response(&resp(500, "Timeout"), "x").is_transient());
        assert!(matches!(from_response(&resp(403, "Forbidden"), "x"), StoreError::Forbidden(_)));
        assert!(matches!(from_response(&resp(422, "Invalid"), "x"), StoreError::Invalid(_)));
        assert!(matches!(from_response(&resp(500, "InternalError"), "x"), StoreError::Api { code: 500, .. }));
    }

    #[test]
    fn kube_api_error_is_classified_through_chain() {
        let err = kube::Error::Api(resp(409, "AlreadyExists"));
        assert!(classify(&err, "Job a").is_already_exists());
        assert!(classify_dyn(&err, "Job a").is_already_exists());
    }

    #[derive(Debug)]
    struct Wrapped(std::io::Error);
    impl std::fmt::Display for Wrapped {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "request failed") }
    }
    impl StdError for Wrapped {
        fn source(&self) -> Option<&(dyn StdError + 'static)> { Some(&self.0) }
    }

    #[test]
    fn network_errors_are_found_in_source_chain() {
        for kind in [ErrorKind::ConnectionRefused, ErrorKind::ConnectionReset, ErrorKind::TimedOut] {
            let e = Wrapped(std::io::Error::new(kind, "net"));
            assert!(is_network_error(&e), "{:?}", kind);
            assert!(classify_dyn(&e, "x").is_transient());
        }
        let e = Wrapped(std::io::Error::new(ErrorKind::PermissionDenied, "nope"));
        assert!(!is_network_error(&e));
        assert!(matches!(classify_dyn(&e, "x"), StoreError::Client(_)));
    }
}
