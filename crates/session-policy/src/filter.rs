use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::schema::DownstreamPolicy;

/// Pre-compiled blocklist over upstream event types.
pub struct DownstreamFilter {
    patterns: Vec<String>,
    blocked: GlobSet,
}

impl std::fmt::Debug for DownstreamFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownstreamFilter")
            .field("patterns", &self.patterns)
            .finish()
    }
}

impl DownstreamFilter {
    pub fn new(policy: &DownstreamPolicy) -> Result<Self, globset::Error> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &policy.blocked_events {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            patterns: policy.blocked_events.clone(),
            blocked: builder.build()?,
        })
    }

    /// A filter that blocks nothing.
    pub fn allow_all() -> Self {
        Self {
            patterns: Vec::new(),
            blocked: GlobSet::empty(),
        }
    }

    pub fn is_blocked(&self, event_type: &str) -> bool {
        self.blocked.is_match(event_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(patterns: &[&str]) -> DownstreamFilter {
        DownstreamFilter::new(&DownstreamPolicy {
            blocked_events: patterns.iter().map(|p| p.to_string()).collect(),
        })
        .unwrap()
    }

    #[test]
    fn default_policy_blocks_session_updated_only() {
        let f = DownstreamFilter::new(&DownstreamPolicy::default()).unwrap();
        assert!(f.is_blocked("session.updated"));
        assert!(!f.is_blocked("session.created"));
        assert!(!f.is_blocked("response.audio.delta"));
    }

    #[test]
    fn wildcard_patterns() {
        let f = filter(&["rate_limits.*", "response.audio_transcript.*"]);
        assert!(f.is_blocked("rate_limits.updated"));
        assert!(f.is_blocked("response.audio_transcript.delta"));
        assert!(!f.is_blocked("response.audio.delta"));
    }

    #[test]
    fn allow_all_blocks_nothing() {
        assert!(!DownstreamFilter::allow_all().is_blocked("session.updated"));
    }
}
