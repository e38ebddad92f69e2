//! Endpoint configuration
//!
//! Everything a call needs to know about the local endpoint lives in one
//! [`EndpointConfig`] value that is shared (behind an `Arc`) with each call
//! record when the call is created. It can be built in code or loaded from
//! TOML:
//!
//! ```toml
//! terminal_type = 60
//! listen_addr = "0.0.0.0:1720"
//! media_ip = "192.168.1.10"
//! tunneling = true
//! fast_start = false
//!
//! [timers]
//! msd_secs = 30
//! tcs_secs = 30
//!
//! [logging]
//! level = "debug"
//! format = "json"
//!
//! [[capabilities]]
//! codec = "G711Ulaw64k"
//! direction = "ReceiveAndTransmit"
//! params = { Audio = { rx_frames = 20, tx_frames = 20, silence_suppression = false } }
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use rvoip_h323_proto::{CapabilityDirection, Codec, MediaKind};

use crate::capability::Capability;
use crate::errors::{CallError, CallResult};
use crate::logging::{LogFormat, LoggingConfig};

/// Default H.225.0 call signaling port
pub const DEFAULT_H225_PORT: u16 = 1720;

/// Default H.323 terminal type (terminal without MC)
pub const DEFAULT_TERMINAL_TYPE: u8 = 60;

/// Media sessions a call opens by default once negotiation completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallMode {
    /// Bidirectional audio
    AudioCall,
    /// Receive audio only; no transmit channel is opened
    AudioRx,
    /// Transmit audio only
    AudioTx,
    /// Audio plus video
    VideoCall,
    /// T.38 fax
    Fax,
}

impl CallMode {
    /// Media kinds this mode transmits
    pub fn transmit_kinds(self) -> &'static [MediaKind] {
        match self {
            CallMode::AudioCall | CallMode::AudioTx => &[MediaKind::Audio],
            CallMode::AudioRx => &[],
            CallMode::VideoCall => &[MediaKind::Audio, MediaKind::Video],
            CallMode::Fax => &[MediaKind::Data],
        }
    }
}

/// H.245 based DTMF relay modes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DtmfModes {
    /// userInputIndication alphanumeric (basicString)
    pub h245_alphanumeric: bool,
    /// userInputIndication signal
    pub h245_signal: bool,
}

impl DtmfModes {
    pub fn intersect(self, other: DtmfModes) -> DtmfModes {
        DtmfModes {
            h245_alphanumeric: self.h245_alphanumeric && other.h245_alphanumeric,
            h245_signal: self.h245_signal && other.h245_signal,
        }
    }

    pub fn any(self) -> bool {
        self.h245_alphanumeric || self.h245_signal
    }
}

/// Protocol timer durations, in seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerSettings {
    pub msd_secs: u64,
    pub tcs_secs: u64,
    /// OpenLogicalChannel, CloseLogicalChannel and RequestChannelClose
    pub logical_channel_secs: u64,
    pub call_establishment_secs: u64,
    /// Wait for the remote EndSessionCommand
    pub session_secs: u64,
    /// Bound on the admission step for incoming calls
    pub admission_secs: u64,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            msd_secs: 30,
            tcs_secs: 30,
            logical_channel_secs: 30,
            call_establishment_secs: 60,
            session_secs: 15,
            admission_secs: 24,
        }
    }
}

impl TimerSettings {
    pub fn msd(&self) -> Duration {
        Duration::from_secs(self.msd_secs)
    }

    pub fn tcs(&self) -> Duration {
        Duration::from_secs(self.tcs_secs)
    }

    pub fn logical_channel(&self) -> Duration {
        Duration::from_secs(self.logical_channel_secs)
    }

    pub fn call_establishment(&self) -> Duration {
        Duration::from_secs(self.call_establishment_secs)
    }

    pub fn session(&self) -> Duration {
        Duration::from_secs(self.session_secs)
    }

    pub fn admission(&self) -> Duration {
        Duration::from_secs(self.admission_secs)
    }
}

/// Logical channel numbers handed out by this endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRange {
    pub base: u16,
    pub max: u16,
}

impl Default for ChannelRange {
    fn default() -> Self {
        Self { base: 1001, max: 1100 }
    }
}

/// UDP port range for RTP/RTCP pairs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self { start: 10000, end: 20000 }
    }
}

/// Periodic round-trip delay probing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtdSettings {
    /// Unanswered requests tolerated before the call is cleared; 0 disables them
    pub count: u32,
    pub interval_secs: u64,
}

impl RtdSettings {
    pub fn enabled(&self) -> bool {
        self.count > 0 && self.interval_secs > 0
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Configuration shared by every call of one endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub terminal_type: u8,
    /// H.225.0 signaling listen address
    pub listen_addr: SocketAddr,
    /// Address advertised for RTP/RTCP
    pub media_ip: IpAddr,
    pub h323_id: Option<String>,
    pub e164: Option<String>,
    pub display_name: Option<String>,
    /// Tunnel H.245 inside Q.931 when the remote agrees
    pub tunneling: bool,
    pub fast_start: bool,
    pub call_mode: CallMode,
    /// Local capabilities in preference order
    pub capabilities: Vec<Capability>,
    pub dtmf: DtmfModes,
    pub timers: TimerSettings,
    pub max_msd_retries: u32,
    pub channel_range: ChannelRange,
    pub rtp_ports: PortRange,
    pub rtd: RtdSettings,
    /// Regular expression the remote media IP must match
    pub rtp_address_mask: Option<String>,
    pub logging: LoggingConfig,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        let both_ways = CapabilityDirection::ReceiveAndTransmit;
        Self {
            terminal_type: DEFAULT_TERMINAL_TYPE,
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_H225_PORT),
            media_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            h323_id: None,
            e164: None,
            display_name: None,
            tunneling: true,
            fast_start: false,
            call_mode: CallMode::AudioCall,
            capabilities: vec![
                Capability::audio(Codec::G711Ulaw64k, both_ways, 20, 20),
                Capability::audio(Codec::G711Alaw64k, both_ways, 20, 20),
            ],
            dtmf: DtmfModes::default(),
            timers: TimerSettings::default(),
            max_msd_retries: 3,
            channel_range: ChannelRange::default(),
            rtp_ports: PortRange::default(),
            rtd: RtdSettings::default(),
            rtp_address_mask: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl EndpointConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(text: &str) -> CallResult<Self> {
        let config: EndpointConfig = toml::from_str(text).map_err(|e| CallError::Configuration {
            message: format!("Invalid endpoint configuration: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> CallResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| CallError::Configuration {
            message: format!("Cannot read {}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&text)
    }

    pub fn with_terminal_type(mut self, terminal_type: u8) -> Self {
        self.terminal_type = terminal_type;
        self
    }

    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_media_ip(mut self, ip: IpAddr) -> Self {
        self.media_ip = ip;
        self
    }

    pub fn with_h323_id(mut self, id: impl Into<String>) -> Self {
        self.h323_id = Some(id.into());
        self
    }

    pub fn with_e164(mut self, number: impl Into<String>) -> Self {
        self.e164 = Some(number.into());
        self
    }

    pub fn with_tunneling(mut self, enabled: bool) -> Self {
        self.tunneling = enabled;
        self
    }

    pub fn with_fast_start(mut self, enabled: bool) -> Self {
        self.fast_start = enabled;
        self
    }

    pub fn with_call_mode(mut self, mode: CallMode) -> Self {
        self.call_mode = mode;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_dtmf(mut self, dtmf: DtmfModes) -> Self {
        self.dtmf = dtmf;
        self
    }

    pub fn with_timers(mut self, timers: TimerSettings) -> Self {
        self.timers = timers;
        self
    }

    pub fn with_rtd(mut self, count: u32, interval_secs: u64) -> Self {
        self.rtd = RtdSettings { count, interval_secs };
        self
    }

    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    pub fn with_rtp_address_mask(mut self, mask: impl Into<String>) -> Self {
        self.rtp_address_mask = Some(mask.into());
        self
    }

    /// Whether the local capability list offers T.38
    pub fn supports_t38(&self) -> bool {
        self.capabilities.iter().any(|c| c.codec == Codec::T38)
    }

    pub fn validate(&self) -> CallResult<()> {
        if self.capabilities.is_empty() {
            return Err(config_error("at least one capability is required"));
        }
        if self.channel_range.base == 0 || self.channel_range.base > self.channel_range.max {
            return Err(config_error(format!(
                "invalid logical channel range {}..={}",
                self.channel_range.base, self.channel_range.max
            )));
        }
        if self.rtp_ports.start >= self.rtp_ports.end
            || self.rtp_ports.end - self.rtp_ports.start < 2
        {
            return Err(config_error(format!(
                "invalid RTP port range {}..{}",
                self.rtp_ports.start, self.rtp_ports.end
            )));
        }
        if self.max_msd_retries == 0 {
            return Err(config_error("max_msd_retries must be at least 1"));
        }
        if let Some(mask) = &self.rtp_address_mask {
            regex::Regex::new(mask)
                .map_err(|e| config_error(format!("invalid rtp_address_mask: {}", e)))?;
        }
        for cap in &self.capabilities {
            cap.validate()?;
        }
        self.logging.validate()?;
        Ok(())
    }
}

fn config_error(message: impl Into<String>) -> CallError {
    CallError::Configuration { message: message.into() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityParams;

    #[test]
    fn test_defaults() {
        let config = EndpointConfig::default();
        assert_eq!(config.terminal_type, 60);
        assert_eq!(config.listen_addr.port(), 1720);
        assert_eq!(config.timers.msd(), Duration::from_secs(30));
        assert_eq!(config.timers.call_establishment(), Duration::from_secs(60));
        assert_eq!(config.timers.session(), Duration::from_secs(15));
        assert_eq!(config.channel_range, ChannelRange { base: 1001, max: 1100 });
        assert!(config.validate().is_ok());
        assert!(!config.supports_t38());
    }

    #[test]
    fn test_from_toml() {
        let text = r#"
            terminal_type = 50
            media_ip = "10.0.0.5"
            tunneling = false

            [timers]
            msd_secs = 5

            [dtmf]
            h245_signal = true

            [[capabilities]]
            codec = "G729"
            direction = "ReceiveAndTransmit"
            params = { Audio = { rx_frames = 4, tx_frames = 2, silence_suppression = false } }

            [[capabilities]]
            codec = "T38"
            direction = "ReceiveAndTransmit"
            params = "T38"
        "#;
        let config = EndpointConfig::from_toml_str(text).unwrap();
        assert_eq!(config.terminal_type, 50);
        assert!(!config.tunneling);
        assert_eq!(config.timers.msd_secs, 5);
        assert_eq!(config.timers.tcs_secs, 30);
        assert!(config.dtmf.h245_signal);
        assert!(!config.dtmf.h245_alphanumeric);
        assert_eq!(config.capabilities.len(), 2);
        assert_eq!(
            config.capabilities[0].params,
            CapabilityParams::Audio { rx_frames: 4, tx_frames: 2, silence_suppression: false }
        );
        assert!(config.supports_t38());
    }

    #[test]
    fn test_logging_table() {
        let text = r#"
            [logging]
            level = "debug"
            format = "json"
            directives = ["rvoip_h323_transport=warn"]
        "#;
        let config = EndpointConfig::from_toml_str(text).unwrap();
        assert_eq!(config.logging.level().unwrap(), tracing::Level::DEBUG);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.directives, vec!["rvoip_h323_transport=warn".to_string()]);
        assert!(!config.logging.spans);

        assert!(EndpointConfig::from_toml_str("[logging]\nlevel = \"chatty\"").is_err());
        assert_eq!(EndpointConfig::default().logging, LoggingConfig::default());
    }

    #[test]
    fn test_validation_failures() {
        let config = EndpointConfig::default().with_capabilities(Vec::new());
        assert!(matches!(config.validate(), Err(CallError::Configuration { .. })));

        let mut config = EndpointConfig::default();
        config.channel_range = ChannelRange { base: 10, max: 5 };
        assert!(config.validate().is_err());

        let config = EndpointConfig::default().with_rtp_address_mask("([");
        assert!(config.validate().is_err());

        assert!(EndpointConfig::from_toml_str("terminal_type = \"x\"").is_err());
    }

    #[test]
    fn test_dtmf_intersection() {
        let local = DtmfModes { h245_alphanumeric: true, h245_signal: true };
        let remote = DtmfModes { h245_alphanumeric: false, h245_signal: true };
        let joint = local.intersect(remote);
        assert!(!joint.h245_alphanumeric);
        assert!(joint.h245_signal);
        assert!(joint.any());
    }

    #[test]
    fn test_call_mode_kinds() {
        assert_eq!(CallMode::VideoCall.transmit_kinds(), &[MediaKind::Audio, MediaKind::Video]);
        assert!(CallMode::AudioRx.transmit_kinds().is_empty());
    }
}
