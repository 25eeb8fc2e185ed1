pub mod correlation;
pub mod openai;
pub mod render;
pub mod review;

pub use correlation::{create_http_client, CorrelationId, CorrelationMiddleware, CORRELATION_ID_HEADER};
pub use openai::{OpenAIClient, DEFAULT_MODEL};
pub use render::render_review_comment;
pub use review::*;

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// Short version string used in comment footers and the status endpoint.
pub fn get_bot_version() -> String {
    // Release builds inject the hash explicitly
    if let Some(git_hash) = option_env!("REVIEWQ_GIT_HASH") {
        return shorten_hash(git_hash);
    }
    match built_info::GIT_COMMIT_HASH {
        Some(git_hash) => shorten_hash(git_hash),
        None => built_info::PKG_VERSION.to_string(),
    }
}

fn shorten_hash(hash: &str) -> String {
    if hash.len() >= 8 {
        hash[..8].to_string()
    } else {
        hash.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shorten_hash_truncates_long_hashes() {
        assert_eq!(shorten_hash("0123456789abcdef"), "01234567");
    }

    #[test]
    fn test_shorten_hash_keeps_short_hashes() {
        assert_eq!(shorten_hash("abc"), "abc");
    }

    #[test]
    fn test_get_bot_version_is_not_empty() {
        assert!(!get_bot_version().is_empty());
    }
}
