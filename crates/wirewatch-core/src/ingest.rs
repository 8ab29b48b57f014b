use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pcap_parser::traits::{PcapNGPacketBlock, PcapReaderIterator};
use pcap_parser::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::{IpEndpoints, PacketRecord, TransportKind, TransportPorts};

const DEFAULT_TSRESOL: u64 = 1_000_000;
const READER_CAPACITY: usize = 65536;

/// Capture-level facts gathered while ingesting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureInfo {
    pub filename: String,
    pub file_sha256: String,
    pub file_size: u64,
    pub total_packets: u64,
    pub parse_errors: u64,
    pub unsupported_linktype: u64,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub linktype: i32,
}

// ---------------------------------------------------------------------------
// PcapIngestor: turns a pcap/pcapng buffer into ordered PacketRecords
// ---------------------------------------------------------------------------

/// Every captured frame yields exactly one record. Frames whose IP or
/// transport headers cannot be read still count, with those layers absent.
pub struct PcapIngestor {
    pub info: CaptureInfo,
    pub packets: Vec<PacketRecord>,
    linktype: Linktype,
    if_tsresol: Vec<u64>,
}

impl PcapIngestor {
    pub fn from_file(path: &Path) -> Result<Self> {
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let buf = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;

        Self::from_bytes(&filename, &buf)
    }

    pub fn from_bytes(filename: &str, buf: &[u8]) -> Result<Self> {
        let file_sha256 = hex::encode(Sha256::digest(buf));

        tracing::info!(
            file = %filename,
            size = buf.len(),
            sha256 = %file_sha256,
            "ingesting pcap"
        );

        let mut ingestor = Self {
            info: CaptureInfo {
                filename: filename.to_string(),
                file_sha256,
                file_size: buf.len() as u64,
                total_packets: 0,
                parse_errors: 0,
                unsupported_linktype: 0,
                first_timestamp: None,
                last_timestamp: None,
                linktype: Linktype::ETHERNET.0,
            },
            packets: Vec::new(),
            linktype: Linktype::ETHERNET,
            if_tsresol: Vec::new(),
        };

        if buf.len() >= 4 && buf[0] == 0x0a && buf[1] == 0x0d && buf[2] == 0x0d && buf[3] == 0x0a {
            ingestor.read_pcapng(buf)?;
        } else {
            ingestor.read_pcap(buf)?;
        }

        ingestor.info.linktype = ingestor.linktype.0;

        tracing::info!(
            packets = ingestor.info.total_packets,
            errors = ingestor.info.parse_errors,
            "ingestion complete"
        );

        Ok(ingestor)
    }

    pub fn into_parts(self) -> (CaptureInfo, Vec<PacketRecord>) {
        (self.info, self.packets)
    }

    fn read_pcap(&mut self, data: &[u8]) -> Result<()> {
        // the whole file is in memory, so size the reader to hold all of it
        let mut reader = LegacyPcapReader::new(READER_CAPACITY.max(data.len()), data)
            .context("failed to create pcap reader")?;
        let mut nanosecond = false;
        let mut stalled = false;

        loop {
            match reader.next() {
                Ok((consumed, block)) => {
                    stalled = false;
                    match block {
                        PcapBlockOwned::LegacyHeader(header) => {
                            self.linktype = header.network;
                            nanosecond = header.is_nanosecond_precision();
                        }
                        PcapBlockOwned::Legacy(packet) => {
                            let frac = if nanosecond {
                                packet.ts_usec as f64 / 1e9
                            } else {
                                packet.ts_usec as f64 / 1e6
                            };
                            let ts = packet.ts_sec as f64 + frac;
                            self.push_frame(packet.data, ts);
                        }
                        _ => {}
                    }
                    reader.consume(consumed);
                }
                Err(PcapError::Eof) => break,
                Err(PcapError::Incomplete(_)) => {
                    if stalled {
                        tracing::warn!("pcap record larger than reader buffer");
                        self.info.parse_errors += 1;
                        break;
                    }
                    stalled = true;
                    if let Err(e) = reader.refill() {
                        tracing::warn!(error = %e, "pcap refill error");
                        self.info.parse_errors += 1;
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "pcap parse error");
                    self.info.parse_errors += 1;
                    break;
                }
            }
        }
        Ok(())
    }

    fn read_pcapng(&mut self, data: &[u8]) -> Result<()> {
        let mut reader = PcapNGReader::new(READER_CAPACITY.max(data.len()), data)
            .context("failed to create pcapng reader")?;
        let mut stalled = false;

        loop {
            match reader.next() {
                Ok((consumed, block)) => {
                    stalled = false;
                    match block {
                        PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                            // interface ids restart in every section
                            self.if_tsresol.clear();
                        }
                        PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                            self.linktype = idb.linktype;
                            let mut tsresol = DEFAULT_TSRESOL;
                            for opt in &idb.options {
                                if opt.code == OptionCode::IfTsresol {
                                    if let Some(&val) = opt.value.first() {
                                        let resol = if val & 0x80 != 0 {
                                            2u64.checked_pow((val & 0x7f) as u32)
                                        } else {
                                            10u64.checked_pow(val as u32)
                                        };
                                        tsresol = resol.unwrap_or(DEFAULT_TSRESOL);
                                    }
                                }
                            }
                            self.if_tsresol.push(tsresol);
                        }
                        PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                            let tsresol = self
                                .if_tsresol
                                .get(epb.if_id as usize)
                                .copied()
                                .unwrap_or(DEFAULT_TSRESOL);
                            let ts_raw = ((epb.ts_high as u64) << 32) | (epb.ts_low as u64);
                            let secs = ts_raw / tsresol;
                            let frac = ts_raw % tsresol;
                            let ts = secs as f64 + frac as f64 / tsresol as f64;
                            // the block body is padded to 4 bytes; keep only the captured frame
                            self.push_frame(epb.packet_data(), ts);
                        }
                        PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                            // no timestamp on the wire; keep the stream ordered
                            let ts = self.packets.last().map(|p| p.timestamp).unwrap_or(0.0);
                            self.push_frame(spb.packet_data(), ts);
                        }
                        _ => {}
                    }
                    reader.consume(consumed);
                }
                Err(PcapError::Eof) => break,
                Err(PcapError::Incomplete(_)) => {
                    if stalled {
                        tracing::warn!("pcapng block larger than reader buffer");
                        self.info.parse_errors += 1;
                        break;
                    }
                    stalled = true;
                    if let Err(e) = reader.refill() {
                        tracing::warn!(error = %e, "pcapng refill error");
                        self.info.parse_errors += 1;
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "pcapng parse error");
                    self.info.parse_errors += 1;
                    break;
                }
            }
        }
        Ok(())
    }

    fn push_frame(&mut self, data: &[u8], timestamp: f64) {
        let mut record = PacketRecord::new(timestamp, data.len() as u64);
        if let Some((ip, transport)) = self.parse_link_layer(data) {
            record.ip = Some(ip);
            record.transport = transport;
        }
        self.update_timestamps(timestamp);
        self.info.total_packets += 1;
        self.packets.push(record);
    }

    fn update_timestamps(&mut self, ts: f64) {
        let Some(dt) = seconds_to_datetime(ts) else {
            return;
        };
        if self.info.first_timestamp.map_or(true, |first| dt < first) {
            self.info.first_timestamp = Some(dt);
        }
        if self.info.last_timestamp.map_or(true, |last| dt > last) {
            self.info.last_timestamp = Some(dt);
        }
    }

    fn parse_link_layer(&mut self, data: &[u8]) -> Option<(IpEndpoints, Option<TransportPorts>)> {
        match self.linktype {
            Linktype::ETHERNET => parse_ethernet(data),
            // raw IP, no link-layer header
            Linktype::RAW | Linktype(12) => parse_ip_packet(data),
            Linktype::NULL => {
                // BSD loopback: 4-byte header
                if data.len() < 4 {
                    return None;
                }
                parse_ip_packet(&data[4..])
            }
            Linktype::LINUX_SLL => {
                // Linux cooked capture: 16-byte header
                if data.len() < 16 {
                    return None;
                }
                let ethertype = u16::from_be_bytes([data[14], data[15]]);
                if ethertype == 0x0800 || ethertype == 0x86DD {
                    parse_ip_packet(&data[16..])
                } else {
                    None
                }
            }
            _ => {
                self.info.unsupported_linktype += 1;
                None
            }
        }
    }
}

fn parse_ethernet(data: &[u8]) -> Option<(IpEndpoints, Option<TransportPorts>)> {
    if data.len() < 14 {
        return None;
    }

    let mut ethertype = u16::from_be_bytes([data[12], data[13]]);
    let mut offset = 14usize;

    // 802.1Q
    if ethertype == 0x8100 {
        if data.len() < 18 {
            return None;
        }
        ethertype = u16::from_be_bytes([data[16], data[17]]);
        offset = 18;

        // QinQ
        if ethertype == 0x8100 {
            if data.len() < 22 {
                return None;
            }
            ethertype = u16::from_be_bytes([data[20], data[21]]);
            offset = 22;
        }
    }

    if ethertype != 0x0800 && ethertype != 0x86DD {
        return None;
    }

    parse_ip_packet(&data[offset..])
}

fn parse_ip_packet(data: &[u8]) -> Option<(IpEndpoints, Option<TransportPorts>)> {
    use etherparse::{LaxPacketHeaders, NetHeaders, TransportHeader};

    // lax parsing keeps whatever headers fit in a snaplen-truncated frame
    let headers = LaxPacketHeaders::from_ip(data).ok()?;

    let ip = match headers.net {
        Some(NetHeaders::Ipv4(ref h, _)) => IpEndpoints {
            src: IpAddr::V4(Ipv4Addr::from(h.source)),
            dst: IpAddr::V4(Ipv4Addr::from(h.destination)),
        },
        Some(NetHeaders::Ipv6(ref h, _)) => IpEndpoints {
            src: IpAddr::V6(Ipv6Addr::from(h.source)),
            dst: IpAddr::V6(Ipv6Addr::from(h.destination)),
        },
        _ => return None,
    };

    let transport = match headers.transport {
        Some(TransportHeader::Tcp(ref tcp)) => Some(TransportPorts {
            kind: TransportKind::Tcp,
            src_port: tcp.source_port,
            dst_port: tcp.destination_port,
        }),
        Some(TransportHeader::Udp(ref udp)) => Some(TransportPorts {
            kind: TransportKind::Udp,
            src_port: udp.source_port,
            dst_port: udp.destination_port,
        }),
        _ => None,
    };

    Some((ip, transport))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn seconds_to_datetime(ts: f64) -> Option<DateTime<Utc>> {
    if !ts.is_finite() {
        return None;
    }
    let secs = ts.floor();
    let nanos = ((ts - secs) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(secs as i64, nanos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;
    use std::io::Write;

    const MAC_A: [u8; 6] = [0x02, 0, 0, 0, 0, 1];
    const MAC_B: [u8; 6] = [0x02, 0, 0, 0, 0, 2];

    fn udp_frame(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2(MAC_A, MAC_B)
            .ipv4(src, dst, 64)
            .udp(sport, dport);
        let mut out = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut out, payload).unwrap();
        out
    }

    fn tcp_frame(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2(MAC_A, MAC_B)
            .ipv4(src, dst, 64)
            .tcp(sport, dport, 1, 65535);
        let mut out = Vec::with_capacity(builder.size(0));
        builder.write(&mut out, &[]).unwrap();
        out
    }

    fn arp_frame() -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&MAC_B);
        frame.extend_from_slice(&MAC_A);
        frame.extend_from_slice(&0x0806u16.to_be_bytes());
        frame.extend_from_slice(&[0u8; 28]);
        frame
    }

    /// Little-endian microsecond pcap with an Ethernet link type.
    fn legacy_pcap(frames: &[(u32, u32, Vec<u8>)]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0xa1b2c3d4u32.to_le_bytes());
        buf.extend_from_slice(&2u16.to_le_bytes());
        buf.extend_from_slice(&4u16.to_le_bytes());
        buf.extend_from_slice(&0i32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&65535u32.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        for (sec, usec, data) in frames {
            buf.extend_from_slice(&sec.to_le_bytes());
            buf.extend_from_slice(&usec.to_le_bytes());
            buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
            buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
            buf.extend_from_slice(data);
        }
        buf
    }

    #[test]
    fn test_legacy_pcap_records() -> Result<()> {
        let udp = udp_frame([10, 0, 0, 1], [10, 0, 0, 53], 5353, 53, b"query");
        let tcp = tcp_frame([10, 0, 0, 1], [93, 184, 216, 34], 40000, 443);
        let arp = arp_frame();
        let buf = legacy_pcap(&[
            (1_700_000_000, 250_000, udp.clone()),
            (1_700_000_001, 0, tcp.clone()),
            (1_700_000_002, 500_000, arp.clone()),
        ]);

        let ingestor = PcapIngestor::from_bytes("test.pcap", &buf)?;
        let (info, packets) = ingestor.into_parts();

        assert_eq!(info.total_packets, 3);
        assert_eq!(info.parse_errors, 0);
        assert_eq!(info.file_size, buf.len() as u64);
        assert_eq!(info.file_sha256.len(), 64);
        assert_eq!(packets.len(), 3);

        assert_eq!(packets[0].timestamp, 1_700_000_000.25);
        assert_eq!(packets[0].length, udp.len() as u64);
        assert_eq!(
            packets[0].transport,
            Some(TransportPorts {
                kind: TransportKind::Udp,
                src_port: 5353,
                dst_port: 53
            })
        );
        assert_eq!(
            packets[0].ip.map(|ip| ip.dst),
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 53)))
        );

        assert_eq!(packets[1].transport.map(|t| t.kind), Some(TransportKind::Tcp));

        // non-IP frames are kept as bare records
        assert_eq!(packets[2].ip, None);
        assert_eq!(packets[2].transport, None);
        assert_eq!(packets[2].length, arp.len() as u64);

        assert_eq!(info.first_timestamp.map(|t| t.timestamp()), Some(1_700_000_000));
        assert_eq!(info.last_timestamp.map(|t| t.timestamp()), Some(1_700_000_002));
        Ok(())
    }

    fn pcapng_block(block_type: u32, body: &[u8]) -> Vec<u8> {
        let total = (12 + body.len()) as u32;
        let mut block = Vec::new();
        block.extend_from_slice(&block_type.to_le_bytes());
        block.extend_from_slice(&total.to_le_bytes());
        block.extend_from_slice(body);
        block.extend_from_slice(&total.to_le_bytes());
        block
    }

    /// Single-interface pcapng with nanosecond timestamps.
    fn pcapng_nanos(frames: &[(u64, Vec<u8>)]) -> Vec<u8> {
        let mut shb = Vec::new();
        shb.extend_from_slice(&0x1A2B3C4Du32.to_le_bytes());
        shb.extend_from_slice(&1u16.to_le_bytes());
        shb.extend_from_slice(&0u16.to_le_bytes());
        shb.extend_from_slice(&(-1i64).to_le_bytes());

        let mut idb = Vec::new();
        idb.extend_from_slice(&1u16.to_le_bytes());
        idb.extend_from_slice(&0u16.to_le_bytes());
        idb.extend_from_slice(&0u32.to_le_bytes());
        // if_tsresol = 9 (nanoseconds), padded, then opt_endofopt
        idb.extend_from_slice(&9u16.to_le_bytes());
        idb.extend_from_slice(&1u16.to_le_bytes());
        idb.extend_from_slice(&[9, 0, 0, 0]);
        idb.extend_from_slice(&[0, 0, 0, 0]);

        let mut buf = pcapng_block(0x0A0D0D0A, &shb);
        buf.extend(pcapng_block(1, &idb));
        for (ts, data) in frames {
            let mut epb = Vec::new();
            epb.extend_from_slice(&0u32.to_le_bytes());
            epb.extend_from_slice(&((ts >> 32) as u32).to_le_bytes());
            epb.extend_from_slice(&(*ts as u32).to_le_bytes());
            epb.extend_from_slice(&(data.len() as u32).to_le_bytes());
            epb.extend_from_slice(&(data.len() as u32).to_le_bytes());
            epb.extend_from_slice(data);
            while epb.len() % 4 != 0 {
                epb.push(0);
            }
            buf.extend(pcapng_block(6, &epb));
        }
        buf
    }

    #[test]
    fn test_pcapng_records_with_tsresol() -> Result<()> {
        let udp = udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1234, 53, b"hello");
        let buf = pcapng_nanos(&[
            (1_700_000_000_500_000_000, udp.clone()),
            (1_700_000_001_000_000_000, arp_frame()),
        ]);

        let ingestor = PcapIngestor::from_bytes("test.pcapng", &buf)?;
        assert_eq!(ingestor.info.total_packets, 2);
        assert_eq!(ingestor.info.parse_errors, 0);
        assert_eq!(ingestor.packets[0].timestamp, 1_700_000_000.5);
        assert_eq!(ingestor.packets[0].length, udp.len() as u64);
        assert_eq!(ingestor.packets[0].transport.map(|t| t.src_port), Some(1234));
        assert_eq!(ingestor.packets[1].timestamp, 1_700_000_001.0);
        assert_eq!(ingestor.packets[1].ip, None);
        Ok(())
    }

    #[test]
    fn test_truncated_record_counts_as_error() -> Result<()> {
        let udp = udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1, 2, b"x");
        let mut buf = legacy_pcap(&[(10, 0, udp.clone()), (11, 0, udp)]);
        buf.truncate(buf.len() - 5);

        let ingestor = PcapIngestor::from_bytes("cut.pcap", &buf)?;
        assert_eq!(ingestor.packets.len(), 1);
        assert_eq!(ingestor.info.parse_errors, 1);
        Ok(())
    }

    #[test]
    fn test_from_file() -> Result<()> {
        let frames: Vec<(u32, u32, Vec<u8>)> = (0..5)
            .map(|i| (100 + i, 0, udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1000, 53, b"abc")))
            .collect();
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(&legacy_pcap(&frames))?;

        let ingestor = PcapIngestor::from_file(file.path())?;
        assert_eq!(ingestor.info.total_packets, 5);
        assert!(ingestor.packets.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        Ok(())
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(PcapIngestor::from_file(Path::new("/nonexistent/capture.pcap")).is_err());
    }

    #[test]
    fn test_vlan_tagged_frame() {
        let mut frame = udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 7, 9, b"");
        // splice an 802.1Q tag in after the MAC addresses
        let tag = [0x81, 0x00, 0x00, 0x64];
        frame.splice(12..12, tag);
        let (ip, transport) = parse_ethernet(&frame).unwrap();
        assert_eq!(ip.src, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(transport.map(|t| t.dst_port), Some(9));
    }

    #[test]
    fn test_snaplen_truncated_frame_keeps_headers() -> Result<()> {
        let builder = PacketBuilder::ethernet2(MAC_A, MAC_B)
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(40000, 443, 1, 65535);
        let payload = [0xabu8; 200];
        let mut frame = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut frame, &payload).unwrap();
        frame.truncate(96);

        let (ip, transport) = parse_ethernet(&frame).unwrap();
        assert_eq!(ip.dst, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(
            transport,
            Some(TransportPorts {
                kind: TransportKind::Tcp,
                src_port: 40000,
                dst_port: 443
            })
        );

        // the same frame through a capture file counts under tcp, at its captured length
        let buf = legacy_pcap(&[(1, 0, frame.clone())]);
        let ingestor = PcapIngestor::from_bytes("snap.pcap", &buf)?;
        assert_eq!(ingestor.packets[0].length, 96);
        assert_eq!(ingestor.packets[0].transport.map(|t| t.kind), Some(TransportKind::Tcp));
        Ok(())
    }

    #[test]
    fn test_pcapng_odd_length_frame_ignores_padding() -> Result<()> {
        // 14 + 20 + 8 + 3 = 45 bytes, padded to 48 inside the block
        let udp = udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1, 2, b"abc");
        assert_eq!(udp.len() % 4, 1);
        let buf = pcapng_nanos(&[(1_000_000_000, udp.clone())]);

        let ingestor = PcapIngestor::from_bytes("odd.pcapng", &buf)?;
        assert_eq!(ingestor.packets[0].length, udp.len() as u64);
        Ok(())
    }

    #[test]
    fn test_seconds_to_datetime() {
        let dt = seconds_to_datetime(1_700_000_000.5).unwrap();
        assert_eq!(dt.timestamp(), 1_700_000_000);
        assert_eq!(dt.timestamp_subsec_millis(), 500);
        assert!(seconds_to_datetime(f64::NAN).is_none());
    }
}
