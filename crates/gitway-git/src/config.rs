//! Session configuration.

use serde::{Deserialize, Serialize};

/// Default agent string advertised to clients.
pub const DEFAULT_AGENT: &str = concat!("gitway/", env!("CARGO_PKG_VERSION"));

/// Knobs shared by every session a dispatcher opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Whether the backend can serve and accept thin packs. When false,
    /// `no-thin` is advertised and `thin-pack` is not.
    pub allow_thin_pack: bool,
    /// Emit the `# service=<name>` line and flush before the ref listing.
    pub advertise_service_prefix: bool,
    /// Reject wants that were not advertised.
    pub strict_wants: bool,
    /// Under strict wants, also accept objects reachable from an advertised tip.
    pub allow_reachable_sha1_in_want: bool,
    /// Accept ref deletions.
    pub allow_deletes: bool,
    /// Reject updates whose new value does not descend from the old one.
    pub deny_non_fast_forwards: bool,
    /// Advertise `push-options`.
    pub allow_push_options: bool,
    /// Advertise `atomic`.
    pub allow_atomic: bool,
    /// Value of the `agent` capability.
    pub agent: String,
    /// One negotiation round per request, as smart HTTP does it. The
    /// advertisement is served separately and the session ends after the
    /// first round that does not produce a pack.
    pub stateless_rpc: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            allow_thin_pack: false,
            advertise_service_prefix: true,
            strict_wants: true,
            allow_reachable_sha1_in_want: false,
            allow_deletes: true,
            deny_non_fast_forwards: false,
            allow_push_options: true,
            allow_atomic: true,
            agent: DEFAULT_AGENT.to_string(),
            stateless_rpc: false,
        }
    }
}
