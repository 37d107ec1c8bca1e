//! Community reputation sources for the reputation stage.

/// External opinion on a domain, in `[0, 1]` (1 = certainly a tracker).
pub trait CommunityScore: Send + Sync {
    /// `None` when the source has no opinion.
    fn score(&self, domain: &str) -> Option<f64>;
}

/// Keyword heuristic used when no community feed is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordCommunityScore;

const TRACKER_KEYWORDS: [&str; 4] = ["track", "analytics", "ads", "pixel"];
const ASSET_KEYWORDS: [&str; 3] = ["cdn", "static", "assets"];

impl CommunityScore for KeywordCommunityScore {
    fn score(&self, domain: &str) -> Option<f64> {
        if TRACKER_KEYWORDS.iter().any(|k| domain.contains(k)) {
            Some(0.8)
        } else if ASSET_KEYWORDS.iter().any(|k| domain.contains(k)) {
            Some(0.3)
        } else {
            Some(0.5)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_drive_the_heuristic() {
        let scorer = KeywordCommunityScore;
        assert_eq!(scorer.score("pixel.mailer.io"), Some(0.8));
        assert_eq!(scorer.score("static.cdn.example.com"), Some(0.3));
        assert_eq!(scorer.score("example.org"), Some(0.5));
    }
}
