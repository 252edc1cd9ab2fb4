//! Tunables for the reconciler, fetcher, and directory client.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Whether a signed-prekey signature failure aborts the handshake
    /// (`true`, the default) or is merely logged and the caller proceeds
    /// anyway. The latter exists only for compatibility testing against
    /// peers running older, non-conforming clients.
    pub fail_closed_on_signature_error: bool,
    /// How long a rotated-out signed prekey's private half is retained
    /// under `Label::SpkPrivPrevious` so in-flight handshakes addressed to
    /// it can still complete.
    pub spk_grace_window: Duration,
    /// Replenish one-time prekeys once the directory reports fewer than
    /// this many remaining.
    pub otpk_replenish_threshold: u32,
    /// Per-RPC deadline applied to every directory call.
    pub directory_deadline: Duration,
    /// Bearer token attached to every directory RPC via `tonic::metadata`.
    /// `None` only in tests that talk to an undialed stub; a real directory
    /// client is supplied one by the auth layer before making any call.
    pub bearer_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fail_closed_on_signature_error: true,
            spk_grace_window: Duration::from_secs(14 * 24 * 60 * 60),
            otpk_replenish_threshold: 20,
            directory_deadline: Duration::from_secs(10),
            bearer_token: None,
        }
    }
}
