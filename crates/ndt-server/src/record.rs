//! Durable per-session records: one JSON line in `meta.jsonl` and one CSV
//! line in `ndt-summary.log`, both under the configured log directory.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ndt_diag::{DiagnosticResult, TcpCounters};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::runners::meta::ClientMeta;

pub const META_FILE: &str = "meta.jsonl";
pub const SUMMARY_FILE: &str = "ndt-summary.log";

#[derive(Debug, Clone, Serialize)]
pub struct MetaRecord {
    pub session: String,
    pub date: DateTime<Utc>,
    pub client_ip: IpAddr,
    pub server_ip: IpAddr,
    pub client_os: Option<String>,
    pub client_browser: Option<String>,
    pub client_application: Option<String>,
    pub client_kernel: Option<String>,
    pub client_version: Option<String>,
    pub c2s_snaplog: Option<String>,
    pub s2c_snaplog: Option<String>,
    pub summary: String,
    pub additional: Vec<(String, String)>,
}

impl MetaRecord {
    pub fn new(session: &str, date: DateTime<Utc>, client_ip: IpAddr, server_ip: IpAddr) -> Self {
        MetaRecord {
            session: session.to_string(),
            date,
            client_ip,
            server_ip,
            client_os: None,
            client_browser: None,
            client_application: None,
            client_kernel: None,
            client_version: None,
            c2s_snaplog: None,
            s2c_snaplog: None,
            summary: String::new(),
            additional: Vec::new(),
        }
    }

    /// Merge what the meta test gathered.
    pub fn merge_client(&mut self, meta: ClientMeta) {
        self.client_os = meta.os;
        self.client_browser = meta.browser;
        self.client_application = meta.application;
        self.client_kernel = meta.kernel;
        if meta.version.is_some() {
            self.client_version = meta.version;
        }
        self.additional.extend(meta.additional);
    }
}

/// Inputs for the summary line.
#[derive(Debug, Clone)]
pub struct Summary<'a> {
    pub date: DateTime<Utc>,
    pub client_ip: IpAddr,
    pub c2s_kbps: f64,
    pub s2c_kbps: f64,
    pub mid_kbps: f64,
    pub counters: &'a TcpCounters,
    pub result: &'a DiagnosticResult,
    /// Window change counts: observer's ack flow or the S2C sampler trend.
    pub window_changes: (i64, i64, i64),
}

impl Summary<'_> {
    pub fn csv_line(&self) -> String {
        let c = self.counters;
        let r = self.result;
        let (inc, dec, same) = self.window_changes;
        format!(
            "{},{},{:.0},{:.0},{:.0},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}\n",
            self.date.format("%Y-%m-%dT%H:%M:%SZ"),
            self.client_ip,
            self.c2s_kbps,
            self.s2c_kbps,
            self.mid_kbps,
            c.timeouts,
            c.sum_rtt,
            c.count_rtt,
            c.pkts_retrans,
            c.congestion_signals,
            c.max_ssthresh,
            c.max_rwin_rcvd,
            c.current_mss,
            c.pkts_out,
            c.data_bytes_out,
            inc,
            dec,
            same,
            r.links.c2s_data,
            r.links.s2c_data,
            r.link,
            r.mismatch,
            r.bad_cable as i32,
        )
    }
}

/// The summary string kept inside the meta record.
pub fn summary_text(c2s_kbps: f64, s2c_kbps: f64, r: &DiagnosticResult) -> String {
    format!(
        "c2s={:.0} s2c={:.0} link={} mismatch={} congestion={} bad_cable={} half_duplex={}",
        c2s_kbps, s2c_kbps, r.link, r.mismatch, r.congestion as i32, r.bad_cable as i32, r.half_duplex as i32
    )
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}

/// Writes session records under one directory.
#[derive(Debug, Clone)]
pub struct RecordSink {
    dir: PathBuf,
}

impl RecordSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        RecordSink { dir: dir.into() }
    }

    pub async fn write_meta(&self, record: &MetaRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_string(record).map_err(std::io::Error::other)?;
        line.push('\n');
        append_line(&self.dir.join(META_FILE), &line).await
    }

    pub async fn write_summary(&self, summary: &Summary<'_>) -> std::io::Result<()> {
        append_line(&self.dir.join(SUMMARY_FILE), &summary.csv_line()).await
    }
}
