//! Server configuration.
//!
//! A TOML document deserializes into [`ServerConfigInput`] (every key
//! optional) and is then resolved into a validated [`ServerConfig`]. CLI
//! flags write into the same input struct before resolution, so they win
//! over file values.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use ndt_diag::HeuristicVersion;
use serde::Deserialize;

pub const DEFAULT_CONTROL_PORT: u16 = 3001;
pub const DEFAULT_MAX_CLIENTS: usize = 50;

// ─── Input ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfigInput {
    pub bind_addr: Option<String>,
    pub admin_view: Option<bool>,
    pub multiple: Option<bool>,
    pub max_clients: Option<usize>,
    pub queue: Option<bool>,
    pub tcp_buffer_size: Option<usize>,
    pub log_dir: Option<PathBuf>,
    pub syslog: Option<bool>,
    pub syslog_facility: Option<String>,
    pub heuristic_version: Option<HeuristicVersion>,
    pub snaplog: Option<bool>,
    pub snap_delay_ms: Option<u64>,
    pub cwnd_decrease: Option<bool>,
    pub avoid_snd_blockup: Option<bool>,
    pub ports: PortsInput,
    pub capture: CaptureInput,
    pub timeouts: TimeoutsInput,
    pub durations: DurationsInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PortsInput {
    pub control: Option<u16>,
    pub c2s: Option<u16>,
    pub middlebox: Option<u16>,
    pub s2c: Option<u16>,
    pub range: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CaptureInput {
    pub enabled: Option<bool>,
    pub device: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimeoutsInput {
    pub login_secs: Option<u64>,
    pub connect_wait_secs: Option<u64>,
    pub accept_retries: Option<u32>,
    pub session_secs: Option<u64>,
    pub stale_after_secs: Option<u64>,
    pub tick_secs: Option<u64>,
    pub probe_millis: Option<u64>,
    pub observer_limit_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DurationsInput {
    pub middlebox_secs: Option<f64>,
    pub c2s_secs: Option<f64>,
    pub s2c_secs: Option<f64>,
}

// ─── Resolved ────────────────────────────────────────────────────────────────

/// Ports announced for each phase in single-client mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    pub control: u16,
    pub c2s: u16,
    pub middlebox: u16,
    pub s2c: u16,
    /// Pool for test listeners in multi-client mode.
    pub range: Option<PortRange>,
}

impl Default for PortConfig {
    fn default() -> Self {
        PortConfig::derived_from(DEFAULT_CONTROL_PORT)
    }
}

impl PortConfig {
    /// Test ports placed right after the control port.
    pub fn derived_from(control: u16) -> Self {
        PortConfig {
            control,
            c2s: control.wrapping_add(1),
            middlebox: control.wrapping_add(2),
            s2c: control.wrapping_add(3),
            range: None,
        }
    }
}

/// Inclusive port ranges, e.g. `"3010-3020,4000-4010"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRange {
    spans: Vec<(u16, u16)>,
}

impl PortRange {
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut spans = Vec::new();
        for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (lo, hi) = match part.split_once('-') {
                Some((lo, hi)) => (lo.trim(), hi.trim()),
                None => (part, part),
            };
            let lo: u16 = lo
                .parse()
                .map_err(|_| format!("invalid port range '{}'", part))?;
            let hi: u16 = hi
                .parse()
                .map_err(|_| format!("invalid port range '{}'", part))?;
            if lo == 0 || lo > hi {
                return Err(format!("invalid port range '{}'", part));
            }
            spans.push((lo, hi));
        }
        if spans.is_empty() {
            return Err("empty port range".into());
        }
        Ok(PortRange { spans })
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> + Clone + '_ {
        self.spans.iter().flat_map(|&(lo, hi)| lo..=hi)
    }

    pub fn len(&self) -> usize {
        self.spans
            .iter()
            .map(|&(lo, hi)| usize::from(hi - lo) + 1)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CaptureConfig {
    pub enabled: bool,
    /// Interface to capture on; auto-detected when `None`.
    pub device: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    pub login: Duration,
    pub connect_wait: Duration,
    pub accept_retries: u32,
    pub session: Duration,
    pub stale_after: Duration,
    pub tick: Duration,
    pub probe: Duration,
    pub observer_limit: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            login: Duration::from_secs(15),
            connect_wait: Duration::from_secs(5),
            accept_retries: 5,
            session: Duration::from_secs(120),
            stale_after: Duration::from_secs(60),
            tick: Duration::from_secs(3),
            probe: Duration::from_millis(1500),
            observer_limit: Duration::from_secs(45),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Durations {
    pub middlebox: Duration,
    pub c2s: Duration,
    pub s2c: Duration,
}

impl Default for Durations {
    fn default() -> Self {
        Self {
            middlebox: Duration::from_secs(5),
            c2s: Duration::from_secs(10),
            s2c: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    pub admin_view: bool,
    pub multiple: bool,
    pub max_clients: usize,
    pub queue: bool,
    pub tcp_buffer_size: Option<usize>,
    pub log_dir: Option<PathBuf>,
    pub syslog: bool,
    pub syslog_facility: Option<String>,
    pub heuristic_version: HeuristicVersion,
    pub snaplog: bool,
    pub snap_delay: Duration,
    pub cwnd_decrease: bool,
    pub avoid_snd_blockup: bool,
    pub ports: PortConfig,
    pub capture: CaptureConfig,
    pub timeouts: Timeouts,
    pub durations: Durations,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            admin_view: false,
            multiple: false,
            max_clients: DEFAULT_MAX_CLIENTS,
            queue: true,
            tcp_buffer_size: None,
            log_dir: None,
            syslog: false,
            syslog_facility: None,
            heuristic_version: HeuristicVersion::default(),
            snaplog: false,
            snap_delay: Duration::from_millis(5),
            cwnd_decrease: false,
            avoid_snd_blockup: false,
            ports: PortConfig::default(),
            capture: CaptureConfig::default(),
            timeouts: Timeouts::default(),
            durations: Durations::default(),
        }
    }
}

fn secs_f64(name: &str, v: Option<f64>, default: Duration) -> Result<Duration, String> {
    match v {
        None => Ok(default),
        Some(s) if s.is_finite() && s > 0.0 => Ok(Duration::from_secs_f64(s)),
        Some(s) => Err(format!("{} must be a positive number of seconds, got {}", name, s)),
    }
}

impl ServerConfigInput {
    pub fn resolve(self) -> Result<ServerConfig, String> {
        let defaults = ServerConfig::default();

        let bind_addr = match self.bind_addr {
            Some(s) => s
                .parse::<IpAddr>()
                .map_err(|_| format!("invalid bind_addr '{}'", s))?,
            None => defaults.bind_addr,
        };

        let max_clients = self.max_clients.unwrap_or(defaults.max_clients);
        if max_clients == 0 {
            return Err("max_clients must be at least 1".into());
        }

        let control = self.ports.control.unwrap_or(DEFAULT_CONTROL_PORT);
        let derived = PortConfig::derived_from(control);
        let ports = PortConfig {
            control,
            c2s: self.ports.c2s.unwrap_or(derived.c2s),
            middlebox: self.ports.middlebox.unwrap_or(derived.middlebox),
            s2c: self.ports.s2c.unwrap_or(derived.s2c),
            range: self.ports.range.as_deref().map(PortRange::parse).transpose()?,
        };

        let d = defaults.timeouts;
        let t = self.timeouts;
        let secs = |v: Option<u64>, dflt: Duration| v.map(Duration::from_secs).unwrap_or(dflt);
        let timeouts = Timeouts {
            login: secs(t.login_secs, d.login),
            connect_wait: secs(t.connect_wait_secs, d.connect_wait),
            accept_retries: t.accept_retries.unwrap_or(d.accept_retries).max(1),
            session: secs(t.session_secs, d.session),
            stale_after: secs(t.stale_after_secs, d.stale_after),
            tick: secs(t.tick_secs, d.tick),
            probe: t.probe_millis.map(Duration::from_millis).unwrap_or(d.probe),
            observer_limit: secs(t.observer_limit_secs, d.observer_limit),
        };
        if timeouts.tick.is_zero() {
            return Err("timeouts.tick_secs must be at least 1".into());
        }

        let dd = defaults.durations;
        let durations = Durations {
            middlebox: secs_f64("durations.middlebox_secs", self.durations.middlebox_secs, dd.middlebox)?,
            c2s: secs_f64("durations.c2s_secs", self.durations.c2s_secs, dd.c2s)?,
            s2c: secs_f64("durations.s2c_secs", self.durations.s2c_secs, dd.s2c)?,
        };

        let snap_delay = self
            .snap_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.snap_delay);
        if snap_delay.is_zero() {
            return Err("snap_delay_ms must be at least 1".into());
        }

        Ok(ServerConfig {
            bind_addr,
            admin_view: self.admin_view.unwrap_or(defaults.admin_view),
            multiple: self.multiple.unwrap_or(defaults.multiple),
            max_clients,
            queue: self.queue.unwrap_or(defaults.queue),
            tcp_buffer_size: self.tcp_buffer_size,
            log_dir: self.log_dir,
            syslog: self.syslog.unwrap_or(defaults.syslog),
            syslog_facility: self.syslog_facility,
            heuristic_version: self.heuristic_version.unwrap_or_default(),
            snaplog: self.snaplog.unwrap_or(defaults.snaplog),
            snap_delay,
            cwnd_decrease: self.cwnd_decrease.unwrap_or(defaults.cwnd_decrease),
            avoid_snd_blockup: self.avoid_snd_blockup.unwrap_or(defaults.avoid_snd_blockup),
            ports,
            capture: CaptureConfig {
                enabled: self.capture.enabled.unwrap_or(false),
                device: self.capture.device,
            },
            timeouts,
            durations,
        })
    }
}

impl ServerConfigInput {
    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        if input.trim().is_empty() {
            return Ok(ServerConfigInput::default());
        }
        toml::from_str(input).map_err(|e| format!("Invalid config TOML: {}", e))
    }
}

impl ServerConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        ServerConfigInput::from_toml_str(input)?.resolve()
    }

    /// Simultaneously running sessions.
    pub fn concurrency(&self) -> usize {
        if self.multiple {
            self.max_clients
        } else {
            1
        }
    }
}
