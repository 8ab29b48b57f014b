use std::collections::HashSet;
use std::net::IpAddr;

use crate::error::{Error, Result};
use crate::models::*;
use crate::table::FeatureTable;

pub const DEFAULT_WINDOW_SECS: f64 = 60.0;

/// A contiguous run of packets that share one window.
#[derive(Debug, Clone, Copy)]
pub struct Window<'a> {
    pub start: f64,
    pub packets: &'a [PacketRecord],
}

/// Splits an ordered packet sequence into windows anchored on the first packet
/// of each window.
///
/// Packets must be in non-decreasing timestamp order; the aggregator does not
/// sort. Window boundaries follow the traffic, not the wall clock: a window
/// opened at `t0` takes every packet with `t - t0 <= window_size`, and the
/// first packet past that opens the next window at its own timestamp.
#[derive(Debug, Clone, Copy)]
pub struct WindowAggregator {
    window_size: f64,
}

impl Default for WindowAggregator {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SECS,
        }
    }
}

impl WindowAggregator {
    pub fn new(window_size: f64) -> Result<Self> {
        if !window_size.is_finite() || window_size <= 0.0 {
            return Err(Error::InvalidWindowSize(window_size));
        }
        Ok(Self { window_size })
    }

    pub fn window_size(&self) -> f64 {
        self.window_size
    }

    pub fn partition<'a>(&self, packets: &'a [PacketRecord]) -> Vec<Window<'a>> {
        let mut windows = Vec::new();
        let Some(first) = packets.first() else {
            return windows;
        };

        let mut window_start = first.timestamp;
        let mut open_from = 0usize;

        for (i, pkt) in packets.iter().enumerate() {
            if pkt.timestamp - window_start <= self.window_size {
                continue;
            }
            windows.push(Window {
                start: window_start,
                packets: &packets[open_from..i],
            });
            window_start = pkt.timestamp;
            open_from = i;
        }

        // no end-of-stream packet closes the last window
        windows.push(Window {
            start: window_start,
            packets: &packets[open_from..],
        });

        windows
    }

    pub fn aggregate(&self, packets: &[PacketRecord]) -> FeatureTable {
        let rows: Vec<WindowFeatureRow> = self
            .partition(packets)
            .into_iter()
            .map(|w| {
                let row = compute_window_features(w.start, w.packets);
                tracing::debug!(
                    start = row.window_start,
                    packets = row.total_packets,
                    bytes = row.total_bytes,
                    "window closed"
                );
                row
            })
            .collect();

        tracing::info!(
            packets = packets.len(),
            windows = rows.len(),
            window_size = self.window_size,
            "aggregation complete"
        );

        FeatureTable::new(rows)
    }
}

/// Aggregate with the given window size. Empty input yields an empty table.
pub fn aggregate(packets: &[PacketRecord], window_size: f64) -> Result<FeatureTable> {
    Ok(WindowAggregator::new(window_size)?.aggregate(packets))
}

/// Summarize one window's packets. Independent of where the window sits in
/// the capture.
pub fn compute_window_features(window_start: f64, packets: &[PacketRecord]) -> WindowFeatureRow {
    let mut total_bytes: u64 = 0;
    let mut src_ips: HashSet<IpAddr> = HashSet::new();
    let mut dst_ips: HashSet<IpAddr> = HashSet::new();
    let mut src_ports: HashSet<u16> = HashSet::new();
    let mut dst_ports: HashSet<u16> = HashSet::new();
    let mut tcp_count: u64 = 0;
    let mut udp_count: u64 = 0;
    let mut other_count: u64 = 0;

    for pkt in packets {
        total_bytes += pkt.length;

        if let Some(ip) = pkt.ip {
            src_ips.insert(ip.src);
            dst_ips.insert(ip.dst);
        }

        match pkt.transport {
            Some(t) => {
                match t.kind {
                    TransportKind::Tcp => tcp_count += 1,
                    TransportKind::Udp => udp_count += 1,
                }
                src_ports.insert(t.src_port);
                dst_ports.insert(t.dst_port);
            }
            None => other_count += 1,
        }
    }

    let total_packets = packets.len() as u64;
    let avg_packet_size = if total_packets > 0 {
        total_bytes as f64 / total_packets as f64
    } else {
        0.0
    };

    WindowFeatureRow {
        window_start,
        total_packets,
        total_bytes,
        unique_src_ips: src_ips.len() as u64,
        unique_dst_ips: dst_ips.len() as u64,
        unique_src_ports: src_ports.len() as u64,
        unique_dst_ports: dst_ports.len() as u64,
        tcp_count,
        udp_count,
        other_count,
        avg_packet_size,
    }
}
