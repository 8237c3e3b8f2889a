//! Build metadata generated by the build script.

include!(concat!(env!("OUT_DIR"), "/version.rs"));

/// Envelope format version stamped on every produced message
pub fn envelope_version() -> u32 {
    ENVELOPE_VERSION
}

pub fn build_time() -> &'static str {
    BUILD_TIME
}

/// Short git hash, or "unknown" outside a checkout
pub fn git_hash() -> &'static str {
    GIT_HASH
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_version_is_positive() {
        assert!(envelope_version() >= 1);
        assert!(!git_hash().is_empty());
        assert!(build_time().ends_with("UTC"));
    }
}
