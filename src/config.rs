//! Engine configuration
//!
//! One struct per protocol layer; field names follow the stable control
//! mapping names consumed on the generic control channel.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete stack configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelsigConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub mtp2: Mtp2Config,
    #[serde(default)]
    pub mtp3: Mtp3Config,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub isup: IsupConfig,
    #[serde(default)]
    pub sccp: SccpConfig,
    #[serde(default)]
    pub tcap: TcapConfig,
    #[serde(default)]
    pub q921: Q921Config,
    #[serde(default)]
    pub q931: Q931Config,
}

/// Engine root settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum non-critical lock wait in microseconds, 0 = infinite
    pub max_lock_wait: u64,
    /// Default worker sleep when no component asks for less
    pub tick_default_us: u64,
}

/// MTP2 data link settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mtp2Config {
    /// Retransmission guard T7
    pub resend_ms: u64,
    /// Alignment abort guard T1
    pub abort_ms: u64,
    /// FISU fill cadence while operational
    pub fill_interval_ms: u64,
    /// Proving period before the link is declared aligned
    pub proving_ms: u64,
    /// Errors tolerated during proving
    pub max_errors: u32,
    /// Keep transmitting fill units on an idle link
    pub fill_link: bool,
    /// Start alignment as soon as the interface reports up
    pub auto_start: bool,
    /// Drop the retransmission queue when realigning
    pub flush_on_align: bool,
    /// Answer an unqualified align request with emergency alignment
    pub auto_emergency: bool,
    /// Error correction: "basic", "preventive" or "adaptive"
    pub error_correction: String,
}

/// MTP3 network settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mtp3Config {
    /// Point code dialect name
    pub pointcodetype: String,
    /// Local point code, "network-cluster-member"
    pub local: String,
    /// Adjacent exchange point code
    pub adjacent: String,
    /// Network indicator name
    pub netindicator: String,
    /// Shift SLS right by one before link selection
    pub slc_shift: bool,
    /// Start with all links management-inhibited
    pub inhibit: bool,
    /// Run periodic SLTM link tests
    pub check_links: bool,
    /// Force realignment of links that answer tests badly
    pub force_align: bool,
    /// SLTM send interval T1
    pub check_t1_ms: u64,
    /// SLTA answer guard T2
    pub check_t2_ms: u64,
}

/// Router / STP settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Act as a transfer point between networks
    pub transfer: bool,
    /// Transfer without advertising route changes
    pub transfer_silent: bool,
    /// Restart procedure guard T20
    pub restart_ms: u64,
    /// Isolation guard T1
    pub isolate_ms: u64,
    /// Include restricted routes in route-set tests
    pub test_restricted: bool,
    /// RST/RSR cadence
    pub route_test_ms: u64,
    /// Delay before traffic is declared ok after restart
    pub traffic_ok_ms: u64,
    /// Emit UPU for unknown service indicators
    pub send_unavailable: bool,
    /// Emit TFP when a route becomes prohibited
    pub send_prohibited: bool,
}

/// ISUP controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsupConfig {
    /// Local point code, "network-cluster-member"
    pub pointcode: String,
    /// Adjacent exchange point code
    pub remote_pointcode: String,
    /// Default SLS strategy: "auto" (per-CIC), "last" or a fixed number
    pub default_sls: String,
    /// Send ACM as soon as the call leaves Setup
    pub early_acm: bool,
    /// Internal Network Number indicator on outgoing called numbers
    pub inn: bool,
    /// Outgoing called/calling number defaults
    pub number_plan: u8,
    pub number_type: u8,
    pub presentation: u8,
    pub screening: u8,
    /// Preferred bearer format name, e.g. "alaw" or "mulaw"
    pub format: String,
    /// Require continuity check on outgoing calls
    pub continuity: bool,
    /// Upper bound on accumulated called digits in overlap mode
    pub max_called_digits: usize,
    /// Replace-circuit attempts after glare or lock collisions
    pub max_replaces: u32,
    /// Reject calls for unknown CICs instead of emitting UCIC
    pub drop_on_unknown: bool,
    /// Lock whole groups rather than single circuits on HW failure
    pub lock_group: bool,
    pub t1_ms: u64,
    pub t5_ms: u64,
    pub t7_ms: u64,
    pub t9_ms: u64,
    pub t12_ms: u64,
    pub t16_ms: u64,
    pub t17_ms: u64,
    pub t18_ms: u64,
    pub t19_ms: u64,
    pub t20_ms: u64,
    pub t21_ms: u64,
    pub t27_ms: u64,
    pub t34_ms: u64,
}

/// SCCP settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SccpConfig {
    /// Initial hop counter on XUDT/LUDT
    pub hop_counter: u8,
    /// Reassembly abandon timeout
    pub segmentation_timeout_ms: u64,
    /// Endpoint mode: never relay, return on any translation miss
    pub endpoint: bool,
    /// "itu" or "ansi"
    pub dialect: String,
}

/// TCAP settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcapConfig {
    pub default_remote_ssn: u8,
    pub default_hop_counter: u8,
    /// Transaction inactivity timeout
    pub transaction_timeout_ms: u64,
    /// "itu" or "ansi"
    pub dialect: String,
}

/// Q.921 settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Q921Config {
    /// NET side when true, CPE otherwise
    pub network: bool,
    /// Re-establish the data link whenever it drops
    pub auto_restart: bool,
    pub sapi: u8,
    pub tei: u8,
    /// Maximum I-frame payload (N201)
    pub max_user_data: usize,
    pub t200_ms: u64,
    pub t203_ms: u64,
    /// Retransmission bound N200
    pub n200: u32,
}

/// Q.931 settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Q931Config {
    /// Behaviour preset name, e.g. "euro-isdn-e1", "national-isdn-t1"
    pub switchtype: String,
    pub primary_rate: bool,
    pub allow_segmentation: bool,
    pub max_segments: u8,
    pub t302_ms: u64,
    pub t303_ms: u64,
    pub t304_ms: u64,
    pub t305_ms: u64,
    pub t308_ms: u64,
    pub t309_ms: u64,
    pub t313_ms: u64,
    pub t314_ms: u64,
    pub t316_ms: u64,
    /// RESTART retransmission bound
    pub n316: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_lock_wait: 10_000, tick_default_us: 5_000 }
    }
}

impl Default for Mtp2Config {
    fn default() -> Self {
        Self {
            resend_ms: 250,
            abort_ms: 5_000,
            fill_interval_ms: 20,
            proving_ms: 500,
            max_errors: 4,
            fill_link: true,
            auto_start: true,
            flush_on_align: false,
            auto_emergency: true,
            error_correction: "basic".to_string(),
        }
    }
}

impl Default for Mtp3Config {
    fn default() -> Self {
        Self {
            pointcodetype: "itu".to_string(),
            local: "0-0-0".to_string(),
            adjacent: "0-0-0".to_string(),
            netindicator: "national".to_string(),
            slc_shift: false,
            inhibit: false,
            check_links: true,
            force_align: false,
            check_t1_ms: 30_000,
            check_t2_ms: 60_000,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            transfer: false,
            transfer_silent: false,
            restart_ms: 60_000,
            isolate_ms: 1_000,
            test_restricted: false,
            route_test_ms: 30_000,
            traffic_ok_ms: 5_000,
            send_unavailable: true,
            send_prohibited: true,
        }
    }
}

impl Default for IsupConfig {
    fn default() -> Self {
        Self {
            pointcode: "0-0-0".to_string(),
            remote_pointcode: "0-0-0".to_string(),
            default_sls: "auto".to_string(),
            early_acm: true,
            inn: false,
            number_plan: 1,
            number_type: 3,
            presentation: 0,
            screening: 3,
            format: "alaw".to_string(),
            continuity: false,
            max_called_digits: 24,
            max_replaces: 3,
            drop_on_unknown: false,
            lock_group: false,
            t1_ms: 15_000,
            t5_ms: 300_000,
            t7_ms: 25_000,
            t9_ms: 0,
            t12_ms: 20_000,
            t16_ms: 15_000,
            t17_ms: 300_000,
            t18_ms: 20_000,
            t19_ms: 300_000,
            t20_ms: 20_000,
            t21_ms: 300_000,
            t27_ms: 240_000,
            t34_ms: 3_000,
        }
    }
}

impl Default for SccpConfig {
    fn default() -> Self {
        Self {
            hop_counter: 15,
            segmentation_timeout_ms: 10_000,
            endpoint: false,
            dialect: "itu".to_string(),
        }
    }
}

impl Default for TcapConfig {
    fn default() -> Self {
        Self {
            default_remote_ssn: 0,
            default_hop_counter: 15,
            transaction_timeout_ms: 30_000,
            dialect: "itu".to_string(),
        }
    }
}

impl Default for Q921Config {
    fn default() -> Self {
        Self {
            network: false,
            auto_restart: true,
            sapi: 0,
            tei: 0,
            max_user_data: 260,
            t200_ms: 1_000,
            t203_ms: 10_000,
            n200: 3,
        }
    }
}

impl Default for Q931Config {
    fn default() -> Self {
        Self {
            switchtype: "euro-isdn-e1".to_string(),
            primary_rate: true,
            allow_segmentation: false,
            max_segments: 8,
            t302_ms: 10_000,
            t303_ms: 4_000,
            t304_ms: 20_000,
            t305_ms: 30_000,
            t308_ms: 4_000,
            t309_ms: 90_000,
            t313_ms: 4_000,
            t314_ms: 4_000,
            t316_ms: 120_000,
            n316: 2,
        }
    }
}

impl TelsigConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: &str) -> Result<Self, crate::TelsigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::TelsigError::Config(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| crate::TelsigError::Config(e.to_string()))
    }
}

impl Q921Config {
    pub fn t200(&self) -> Duration {
        Duration::from_millis(self.t200_ms)
    }

    pub fn t203(&self) -> Duration {
        Duration::from_millis(self.t203_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let cfg: TelsigConfig =
            serde_json::from_str(r#"{"mtp3": {"pointcodetype": "ansi", "local": "1-20-3",
                "adjacent": "1-20-9",
                "netindicator": "national", "slc_shift": true, "inhibit": false,
                "check_links": true, "force_align": false,
                "check_t1_ms": 30000, "check_t2_ms": 60000}}"#)
                .unwrap();
        assert_eq!(cfg.mtp3.pointcodetype, "ansi");
        assert!(cfg.mtp3.slc_shift);
        assert_eq!(cfg.mtp2.resend_ms, 250);
        assert_eq!(cfg.isup.max_called_digits, 24);
    }
}
