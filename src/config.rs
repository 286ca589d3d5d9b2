use std::time::Duration;

/// Highest call protocol version this implementation speaks.
pub const SUPPORTED_PROTOCOL_VERSION: u32 = 1;

/// Knobs of a single group call session.
#[derive(Clone, Debug)]
pub struct GroupCallConfig {
    /// Bound for every SFU HTTP request. A timeout counts as a failed request.
    pub http_timeout: Duration,
    /// How long to wait for the peer connection to report `Connected`.
    pub connect_timeout: Duration,
    /// How long the handshakes with the participants already in the call may take.
    pub handshake_timeout: Duration,
    /// Delay between announcing a post-leave rekey and using the new key.
    pub rekey_apply_delay: Duration,
    pub call_state_update_interval: Duration,
    /// Hostname suffixes an SFU base URL must match. Empty allows every host.
    pub allowed_sfu_hostname_suffixes: Vec<String>,
    /// Used when the SFU does not announce a limit itself.
    pub max_participants: u32,
    pub command_capacity: usize,
    pub event_capacity: usize,
    pub audio_on_join: bool,
    pub video_on_join: bool,
    /// Start over with a fresh session when the peer connection drops.
    pub rejoin_on_disconnect: bool,
    pub max_rejoin_attempts: u32,
}

impl Default for GroupCallConfig {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(10),
            rekey_apply_delay: Duration::from_secs(2),
            call_state_update_interval: Duration::from_secs(10),
            allowed_sfu_hostname_suffixes: Vec::new(),
            max_participants: 100,
            command_capacity: 64,
            event_capacity: 256,
            audio_on_join: false,
            video_on_join: false,
            rejoin_on_disconnect: false,
            max_rejoin_attempts: 3,
        }
    }
}

/// Configuration of the [`GroupCallManager`](crate::group_call::GroupCallManager).
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Failed peeks after which a proposed call is forgotten.
    pub max_peek_failures: u32,
    /// Proposed calls announced longer ago than this are dropped after a failed peek.
    pub stale_call_age: Duration,
    pub refresh_interval: Duration,
    pub supported_protocol_version: u32,
    pub call: GroupCallConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_peek_failures: 3,
            stale_call_age: Duration::from_secs(10 * 60 * 60),
            refresh_interval: Duration::from_secs(10),
            supported_protocol_version: SUPPORTED_PROTOCOL_VERSION,
            call: GroupCallConfig::default(),
        }
    }
}
