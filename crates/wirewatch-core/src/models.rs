use serde::{Deserialize, Serialize};
use std::net::IpAddr;

// ---------------------------------------------------------------------------
// Packets: the normalized output of the ingest layer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct IpEndpoints {
    pub src: IpAddr,
    pub dst: IpAddr,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TransportPorts {
    pub kind: TransportKind,
    pub src_port: u16,
    pub dst_port: u16,
}

/// One captured frame as seen by the window aggregator.
///
/// `ip` is `None` for non-IP frames (ARP, LLDP, ...) and `transport` is `None`
/// for anything that is not TCP or UDP, ICMP included. Both are valid states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PacketRecord {
    /// Capture time in seconds since the epoch.
    pub timestamp: f64,
    /// Captured frame length in bytes.
    pub length: u64,
    pub ip: Option<IpEndpoints>,
    pub transport: Option<TransportPorts>,
}

impl PacketRecord {
    pub fn new(timestamp: f64, length: u64) -> Self {
        Self {
            timestamp,
            length,
            ip: None,
            transport: None,
        }
    }

    pub fn with_ip(mut self, src: IpAddr, dst: IpAddr) -> Self {
        self.ip = Some(IpEndpoints { src, dst });
        self
    }

    pub fn with_tcp(mut self, src_port: u16, dst_port: u16) -> Self {
        self.transport = Some(TransportPorts {
            kind: TransportKind::Tcp,
            src_port,
            dst_port,
        });
        self
    }

    pub fn with_udp(mut self, src_port: u16, dst_port: u16) -> Self {
        self.transport = Some(TransportPorts {
            kind: TransportKind::Udp,
            src_port,
            dst_port,
        });
        self
    }
}

// ---------------------------------------------------------------------------
// Window features: the fixed schema shared by the aggregator and the scorer
// ---------------------------------------------------------------------------

pub const FEATURE_COUNT: usize = 10;

/// Model feature columns, in matrix order.
pub const FEATURE_COLUMNS: [&str; FEATURE_COUNT] = [
    "total_packets",
    "total_bytes",
    "unique_src_ips",
    "unique_dst_ips",
    "unique_src_ports",
    "unique_dst_ports",
    "tcp_count",
    "udp_count",
    "other_count",
    "avg_packet_size",
];

pub type FeatureVector = [f64; FEATURE_COUNT];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowFeatureRow {
    pub window_start: f64,
    pub total_packets: u64,
    pub total_bytes: u64,
    pub unique_src_ips: u64,
    pub unique_dst_ips: u64,
    pub unique_src_ports: u64,
    pub unique_dst_ports: u64,
    pub tcp_count: u64,
    pub udp_count: u64,
    pub other_count: u64,
    pub avg_packet_size: f64,
}

impl WindowFeatureRow {
    /// The row's model features in `FEATURE_COLUMNS` order.
    pub fn to_vector(&self) -> FeatureVector {
        [
            self.total_packets as f64,
            self.total_bytes as f64,
            self.unique_src_ips as f64,
            self.unique_dst_ips as f64,
            self.unique_src_ports as f64,
            self.unique_dst_ports as f64,
            self.tcp_count as f64,
            self.udp_count as f64,
            self.other_count as f64,
            self.avg_packet_size,
        ]
    }

    pub fn get(&self, column: &str) -> Option<f64> {
        let idx = FEATURE_COLUMNS.iter().position(|c| *c == column)?;
        Some(self.to_vector()[idx])
    }
}

// ---------------------------------------------------------------------------
// Scored output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredWindow {
    #[serde(flatten)]
    pub features: WindowFeatureRow,
    pub anomaly_score: Option<f64>,
    pub is_anomaly: bool,
}
