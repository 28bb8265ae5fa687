//! TS/EIT parser: MPEG-TS section reassembly plus ATSC VCT/EIT/ETT and DVB EIT decoding.
//!
//! Dispatches by `table_id` across the two listening PIDs (the ATSC PSIP master guide and the
//! DVB EIT PID). Sync-byte recovery steps byte-by-byte until it finds `0x47` at a 188-byte-aligned
//! offset, since a captured buffer isn't guaranteed to start on a packet boundary.
//!
//! Parsing is synchronous and has no knowledge of the tuner lease or the store: it is run on a
//! captured buffer after the tuner has already been released, and its output is a plain list of
//! upserts and description updates for the orchestrator to apply.

use std::collections::HashMap;

use chrono::{NaiveDate, NaiveTime};

use crate::channel::ChannelRegistry;
use crate::epg::store::ProgramRow;

const TS_PACKET_SIZE: usize = 188;
const SYNC_BYTE: u8 = 0x47;

mod pid {
    pub const ATSC_PSIP: u16 = 0x1FFB;
    pub const DVB_EIT: u16 = 0x0012;
}

mod table_id {
    pub const ATSC_VCT_TERRESTRIAL: u8 = 0xC8;
    pub const ATSC_VCT_CABLE: u8 = 0xC9;
    pub const ATSC_EIT: u8 = 0xCB;
    pub const ATSC_ETT: u8 = 0xCC;
    pub const ATSC_DIAGNOSTIC_RANGE: std::ops::RangeInclusive<u8> = 0xC7..=0xCF;
}

fn is_dvb_eit_table(table_id: u8) -> bool {
    (0x4E..=0x6F).contains(&table_id)
}

/// GPS epoch (1980-01-06 UTC) offset from the Unix epoch, in seconds.
const GPS_UNIX_EPOCH_OFFSET_SECS: i64 = 315_964_800;
/// Leap seconds between GPS and UTC time, as observed by current North American broadcasts.
const GPS_UTC_LEAP_SECONDS: i64 = 18;

#[derive(Debug, Default)]
struct SectionBuffer {
    data: Vec<u8>,
    expected_length: Option<usize>,
    continuity_counter: Option<u8>,
}

/// One ETT-derived update to an already-upserted row, applied by `event_id` match only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptionUpdate {
    pub channel_service_id: String,
    pub event_id: i64,
    pub description: String,
}

/// Everything a captured buffer yielded, for the orchestrator to hand to the store.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParseOutput {
    pub upserts: Vec<ProgramRow>,
    pub description_updates: Vec<DescriptionUpdate>,
}

/// Parses one captured buffer for one frequency. Not reused across frequencies: the SourceMap
/// it builds from VCT sections is scoped to the broadcast it was fed.
pub struct EpgParser<'a> {
    channels: &'a ChannelRegistry,
    frequency: String,
    section_buffers: HashMap<u16, SectionBuffer>,
    source_map: HashMap<u16, String>,
    pid_counts: HashMap<u16, u64>,
    diagnostic_table_counts: HashMap<u8, u64>,
    output: ParseOutput,
}

impl<'a> EpgParser<'a> {
    pub fn new(channels: &'a ChannelRegistry, frequency: impl Into<String>) -> Self {
        Self {
            channels,
            frequency: frequency.into(),
            section_buffers: HashMap::new(),
            source_map: HashMap::new(),
            pid_counts: HashMap::new(),
            diagnostic_table_counts: HashMap::new(),
            output: ParseOutput::default(),
        }
    }

    /// Convenience one-shot entry point: feed a whole captured buffer and collect the result.
    pub fn parse(
        channels: &'a ChannelRegistry,
        frequency: impl Into<String>,
        data: &[u8],
    ) -> ParseOutput {
        let mut parser = Self::new(channels, frequency);
        parser.feed(data);
        parser.finish()
    }

    /// Every PID seen on the wire, including ones this parser never decodes — useful for
    /// confirming, e.g., whether PSIP really is at `0x1FFB` on an unfamiliar multiplex.
    pub fn pid_counts(&self) -> &HashMap<u16, u64> {
        &self.pid_counts
    }

    /// ATSC diagnostic table ids (`0xC7`-`0xCF`) seen, keyed by table id. These carry no program
    /// data this parser decodes, just traffic to confirm a multiplex is alive.
    pub fn diagnostic_table_counts(&self) -> &HashMap<u8, u64> {
        &self.diagnostic_table_counts
    }

    pub fn finish(self) -> ParseOutput {
        self.output
    }

    /// Walk a buffer of TS packets, recovering alignment if it doesn't start on a sync byte.
    pub fn feed(&mut self, data: &[u8]) {
        let mut offset = 0;
        while offset < data.len() && data[offset] != SYNC_BYTE {
            offset += 1;
        }

        while offset + TS_PACKET_SIZE <= data.len() {
            if data[offset] != SYNC_BYTE {
                offset += 1;
                continue;
            }
            self.process_packet(&data[offset..offset + TS_PACKET_SIZE]);
            offset += TS_PACKET_SIZE;
        }
    }

    fn process_packet(&mut self, packet: &[u8]) {
        if packet.len() < 4 || packet[0] != SYNC_BYTE {
            return;
        }

        let transport_error = (packet[1] & 0x80) != 0;
        let pusi = (packet[1] & 0x40) != 0;
        let pid = ((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16;
        let adaptation_field = (packet[3] >> 4) & 0x03;
        let continuity_counter = packet[3] & 0x0F;

        *self.pid_counts.entry(pid).or_insert(0) += 1;

        if transport_error || (pid != pid::ATSC_PSIP && pid != pid::DVB_EIT) {
            return;
        }

        let payload_offset = match adaptation_field {
            1 => 4,
            3 => {
                if packet.len() < 5 {
                    return;
                }
                5 + packet[4] as usize
            }
            _ => return, // 0 reserved, 2 adaptation-only: no payload
        };
        if payload_offset >= packet.len() {
            return;
        }

        self.process_payload(pid, &packet[payload_offset..], pusi, continuity_counter);
    }

    fn process_payload(&mut self, pid: u16, payload: &[u8], pusi: bool, cc: u8) {
        let buffer = self.section_buffers.entry(pid).or_default();

        if pusi {
            if payload.is_empty() {
                return;
            }
            let pointer = payload[0] as usize;
            if pointer + 1 > payload.len() {
                return;
            }
            buffer.data.clear();
            buffer.expected_length = None;
            buffer.continuity_counter = Some(cc);
            buffer.data.extend_from_slice(&payload[pointer + 1..]);
        } else {
            if let Some(expected) = buffer.continuity_counter {
                if cc != (expected + 1) & 0x0F {
                    buffer.data.clear();
                    buffer.expected_length = None;
                    return;
                }
            }
            buffer.continuity_counter = Some(cc);
            buffer.data.extend_from_slice(payload);
        }

        self.try_parse_section(pid);
    }

    fn try_parse_section(&mut self, pid: u16) {
        loop {
            let buffer = match self.section_buffers.get_mut(&pid) {
                Some(b) => b,
                None => return,
            };
            if buffer.data.len() < 3 {
                return;
            }
            let section_length = ((buffer.data[1] as usize & 0x0F) << 8) | buffer.data[2] as usize;
            let total_length = 3 + section_length;
            buffer.expected_length = Some(total_length);
            if buffer.data.len() < total_length {
                return;
            }

            let section: Vec<u8> = buffer.data[..total_length].to_vec();
            buffer.data.drain(..total_length);

            self.dispatch_section(&section);
        }
    }

    fn dispatch_section(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let table_id = data[0];
        match table_id {
            table_id::ATSC_VCT_TERRESTRIAL | table_id::ATSC_VCT_CABLE => self.parse_vct(data),
            table_id::ATSC_EIT => self.parse_atsc_eit(data),
            table_id::ATSC_ETT => self.parse_atsc_ett(data),
            t if is_dvb_eit_table(t) => self.parse_dvb_eit(data),
            t if table_id::ATSC_DIAGNOSTIC_RANGE.contains(&t) => {
                *self.diagnostic_table_counts.entry(t).or_insert(0) += 1;
            }
            _ => {}
        }
    }

    /// Resolve a VCT-decoded `"major.minor"` candidate to the channel collection's identity,
    /// preferring an exact `(frequency, virtualChannel)` match, then `(frequency,
    /// program_number)`, then a global `virtualChannel` match, else the raw candidate.
    fn resolve_virtual_channel(&self, candidate: &str, program_number: u16) -> String {
        let program_number = program_number.to_string();
        if self
            .channels
            .all()
            .iter()
            .any(|c| c.frequency == self.frequency && c.number == candidate)
        {
            return candidate.to_string();
        }
        if let Some(c) = self
            .channels
            .all()
            .iter()
            .find(|c| c.frequency == self.frequency && c.service_id == program_number)
        {
            return c.number.clone();
        }
        if let Some(c) = self.channels.all().iter().find(|c| c.number == candidate) {
            return c.number.clone();
        }
        candidate.to_string()
    }

    fn parse_vct(&mut self, data: &[u8]) {
        if data.len() < 10 {
            return;
        }
        let num_channels = data[9] as usize;
        let mut offset = 10;
        for _ in 0..num_channels {
            if offset + 32 > data.len() {
                break;
            }
            let entry = &data[offset..offset + 32];
            let major = ((entry[14] & 0x0F) as u16) << 6 | (entry[15] >> 2) as u16;
            let minor = ((entry[15] & 0x03) as u16) << 8 | entry[16] as u16;
            let candidate = format!("{}.{}", major, minor);
            let program_number = u16::from_be_bytes([entry[24], entry[25]]);
            let source_id = u16::from_be_bytes([entry[28], entry[29]]);
            let descriptors_length = (((entry[30] & 0x03) as usize) << 8) | entry[31] as usize;

            let resolved = self.resolve_virtual_channel(&candidate, program_number);
            self.source_map.insert(source_id, resolved);

            offset += 32 + descriptors_length;
        }
    }

    fn source_channel(&self, source_id: u16) -> String {
        self.source_map
            .get(&source_id)
            .cloned()
            .unwrap_or_else(|| source_id.to_string())
    }

    fn parse_atsc_eit(&mut self, data: &[u8]) {
        if data.len() < 10 {
            return;
        }
        let source_id = u16::from_be_bytes([data[3], data[4]]);
        let num_events = data[9] as usize;
        let mut offset = 10;

        for _ in 0..num_events {
            if offset + 10 > data.len() {
                break;
            }
            let event = &data[offset..];
            let event_id = (((event[0] & 0x3F) as i64) << 8) | event[1] as i64;
            let start_gps = u32::from_be_bytes([event[2], event[3], event[4], event[5]]) as i64;
            let length_secs =
                (((event[6] & 0x0F) as i64) << 16) | ((event[7] as i64) << 8) | event[8] as i64;
            let title_length = event[9] as usize;

            let title_start = offset + 10;
            if title_start + title_length > data.len() {
                break;
            }
            let title = decode_mss(&data[title_start..title_start + title_length]);

            let desc_len_offset = title_start + title_length;
            if desc_len_offset + 2 > data.len() {
                break;
            }
            let descriptors_length = (((data[desc_len_offset] & 0x0F) as usize) << 8)
                | data[desc_len_offset + 1] as usize;
            let event_total = 10 + title_length + 2 + descriptors_length;

            let start_time = (start_gps + GPS_UNIX_EPOCH_OFFSET_SECS - GPS_UTC_LEAP_SECONDS) * 1000;
            let end_time = start_time + length_secs * 1000;

            if !title.is_empty() && start_time > 0 {
                self.output.upserts.push(ProgramRow {
                    frequency: self.frequency.clone(),
                    channel_service_id: self.source_channel(source_id),
                    start_time,
                    end_time,
                    title,
                    description: String::new(),
                    event_id: Some(event_id),
                    source_id: source_id.to_string(),
                });
            }

            if event_total == 0 {
                break;
            }
            offset += event_total;
        }
    }

    /// The ETM identifier packs `source_id` into its upper 16 bits and a 14-bit `event_id`
    /// starting at bit 2, per the ATSC A/65 ETM_id layout.
    fn parse_atsc_ett(&mut self, data: &[u8]) {
        if data.len() < 13 {
            return;
        }
        let etm_id = u32::from_be_bytes([data[9], data[10], data[11], data[12]]);
        let event_id = ((etm_id >> 2) & 0x3FFF) as i64;
        let source_id = ((etm_id >> 16) & 0xFFFF) as u16;

        let description = decode_mss(&data[13..]);
        if description.is_empty() {
            return;
        }

        self.output.description_updates.push(DescriptionUpdate {
            channel_service_id: self.source_channel(source_id),
            event_id,
            description,
        });
    }

    fn parse_dvb_eit(&mut self, data: &[u8]) {
        if data.len() < 14 {
            return;
        }
        let service_id = u16::from_be_bytes([data[3], data[4]]);
        let channel_service_id = self.resolve_dvb_channel(service_id);

        let mut offset = 14;
        while offset + 12 <= data.len() {
            let event = &data[offset..];
            let mjd = [event[2], event[3]];
            let start_bcd = [event[4], event[5], event[6]];
            let duration_bcd = [event[7], event[8], event[9]];
            let descriptors_length = (((event[10] & 0x0F) as usize) << 8) | event[11] as usize;
            let event_total = 12 + descriptors_length;
            if offset + event_total > data.len() {
                break;
            }

            let mut title = String::new();
            let mut description = String::new();
            let desc_end = offset + event_total;
            let mut desc_offset = offset + 12;
            while desc_offset + 2 <= desc_end {
                let tag = data[desc_offset];
                let len = data[desc_offset + 1] as usize;
                if desc_offset + 2 + len > desc_end {
                    break;
                }
                let desc_data = &data[desc_offset + 2..desc_offset + 2 + len];
                match tag {
                    0x4D => title = parse_short_event_title(desc_data),
                    0x4E => description = parse_extended_event_description(desc_data),
                    _ => {}
                }
                desc_offset += 2 + len;
            }

            if let Some(start_time) = dvb_timestamp_millis(mjd, start_bcd) {
                let end_time = start_time + dvb_duration_seconds(duration_bcd) * 1000;
                if !title.is_empty() && start_time > 0 {
                    self.output.upserts.push(ProgramRow {
                        frequency: self.frequency.clone(),
                        channel_service_id: channel_service_id.clone(),
                        start_time,
                        end_time,
                        title,
                        description,
                        event_id: None,
                        source_id: String::new(),
                    });
                }
            }

            if event_total == 0 {
                break;
            }
            offset += event_total;
        }
    }

    fn resolve_dvb_channel(&self, service_id: u16) -> String {
        let service_id_str = service_id.to_string();
        self.channels
            .all()
            .iter()
            .find(|c| c.frequency == self.frequency && c.service_id == service_id_str)
            .map(|c| c.number.clone())
            .unwrap_or(service_id_str)
    }
}

/// Decode an ATSC Multi-String Structure, keeping only the first string's first segment (the
/// common case for current broadcasts): a 6-byte per-string header (lang code, number of
/// segments, compression type, mode), then a length byte and UTF-8 text.
fn decode_mss(data: &[u8]) -> String {
    if data.is_empty() || data[0] == 0 {
        return String::new();
    }
    let header_end = 1 + 6;
    if data.len() <= header_end {
        return String::new();
    }
    let string_length = data[header_end] as usize;
    let text_start = header_end + 1;
    let text_end = (text_start + string_length).min(data.len());
    if text_start >= text_end {
        return String::new();
    }
    let decoded = String::from_utf8_lossy(&data[text_start..text_end]);
    decoded
        .chars()
        .filter(|&c| c == '\t' || !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

fn strip_dvb_text(data: &[u8]) -> String {
    let data = if data.first().is_some_and(|&b| b < 0x20) {
        &data[1..]
    } else {
        data
    };
    String::from_utf8_lossy(data)
        .chars()
        .filter(|c| c.is_ascii_graphic() || *c == ' ')
        .collect::<String>()
        .trim()
        .to_string()
}

fn parse_short_event_title(data: &[u8]) -> String {
    if data.len() < 4 {
        return String::new();
    }
    let name_length = data[3] as usize;
    let name_start = 4;
    let name_end = (name_start + name_length).min(data.len());
    if name_start >= name_end {
        return String::new();
    }
    strip_dvb_text(&data[name_start..name_end])
}

fn parse_extended_event_description(data: &[u8]) -> String {
    if data.len() < 5 {
        return String::new();
    }
    let items_length = data[4] as usize;
    let text_length_offset = 5 + items_length;
    if text_length_offset >= data.len() {
        return String::new();
    }
    let text_length = data[text_length_offset] as usize;
    let text_start = text_length_offset + 1;
    let text_end = (text_start + text_length).min(data.len());
    if text_start >= text_end {
        return String::new();
    }
    strip_dvb_text(&data[text_start..text_end])
}

fn bcd_to_u32(byte: u8) -> u32 {
    ((byte >> 4) as u32) * 10 + (byte & 0x0F) as u32
}

/// Standard MJD-to-Gregorian-date conversion (ETSI EN 300 468 Annex C).
fn mjd_to_ymd(mjd: u32) -> Option<(i32, u32, u32)> {
    let mjd = mjd as f64;
    let yp = ((mjd - 15078.2) / 365.25).trunc();
    let mp = ((mjd - 14956.1 - (yp * 365.25).trunc()) / 30.6001).trunc();
    let day = mjd - 14956.0 - (yp * 365.25).trunc() - (mp * 30.6001).trunc();
    let k = if mp == 14.0 || mp == 15.0 { 1.0 } else { 0.0 };
    let year = (yp + k + 1900.0) as i32;
    let month = (mp - 1.0 - k * 12.0) as u32;
    Some((year, month, day as u32))
}

/// DVB EIT start time: a 2-byte MJD plus a 3-byte BCD-coded UTC time, each byte two BCD digits
/// (tens then units) for hours, minutes, and seconds respectively.
fn dvb_timestamp_millis(mjd_bytes: [u8; 2], time_bcd: [u8; 3]) -> Option<i64> {
    let mjd = u16::from_be_bytes(mjd_bytes) as u32;
    let (year, month, day) = mjd_to_ymd(mjd)?;
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    let time = NaiveTime::from_hms_opt(
        bcd_to_u32(time_bcd[0]),
        bcd_to_u32(time_bcd[1]),
        bcd_to_u32(time_bcd[2]),
    )?;
    Some(date.and_time(time).and_utc().timestamp_millis())
}

fn dvb_duration_seconds(duration_bcd: [u8; 3]) -> i64 {
    bcd_to_u32(duration_bcd[0]) as i64 * 3600
        + bcd_to_u32(duration_bcd[1]) as i64 * 60
        + bcd_to_u32(duration_bcd[2]) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(channel: &str, service_id: &str, frequency: &str) -> ChannelRegistry {
        ChannelRegistry::parse(&format!(
            "[Ch]\nSERVICE_ID={}\nVCHANNEL={}\nFREQUENCY={}\n",
            service_id, channel, frequency
        ))
    }

    fn vct_section(
        frequency_major: u16,
        frequency_minor: u16,
        program_number: u16,
        source_id: u16,
    ) -> Vec<u8> {
        let mut section = vec![0u8; 10 + 32];
        section[0] = table_id::ATSC_VCT_TERRESTRIAL;
        section[9] = 1; // num_channels

        let entry_offset = 10;
        section[entry_offset + 14] = ((frequency_major >> 6) & 0x0F) as u8;
        section[entry_offset + 15] =
            (((frequency_major & 0x3F) << 2) | (frequency_minor >> 8)) as u8;
        section[entry_offset + 16] = (frequency_minor & 0xFF) as u8;
        section[entry_offset + 24..entry_offset + 26]
            .copy_from_slice(&program_number.to_be_bytes());
        section[entry_offset + 28..entry_offset + 30].copy_from_slice(&source_id.to_be_bytes());

        let section_length = section.len() - 3;
        section[1] = ((section_length >> 8) & 0x0F) as u8;
        section[2] = (section_length & 0xFF) as u8;
        section
    }

    fn atsc_eit_section(
        source_id: u16,
        event_id: u16,
        start_gps: u32,
        duration: u32,
        title: &str,
    ) -> Vec<u8> {
        let mut mss = vec![1u8]; // num_strings
        mss.extend_from_slice(&[b'e', b'n', b'g', 1, 0, 0]); // lang + num_segments + compression + mode
        mss.push(title.len() as u8);
        mss.extend_from_slice(title.as_bytes());

        let mut section = vec![0u8; 10];
        section[0] = table_id::ATSC_EIT;
        section[3..5].copy_from_slice(&source_id.to_be_bytes());
        section[9] = 1; // num_events

        let mut event = vec![0u8; 10];
        event[0] = ((event_id >> 8) & 0x3F) as u8;
        event[1] = (event_id & 0xFF) as u8;
        event[2..6].copy_from_slice(&start_gps.to_be_bytes());
        event[6] = ((duration >> 16) & 0x0F) as u8;
        event[7] = ((duration >> 8) & 0xFF) as u8;
        event[8] = (duration & 0xFF) as u8;
        event[9] = mss.len() as u8;
        section.extend_from_slice(&event);
        section.extend_from_slice(&mss);
        section.extend_from_slice(&[0x00, 0x00]); // descriptors_length = 0

        let section_length = section.len() - 3;
        section[1] = ((section_length >> 8) & 0x0F) as u8;
        section[2] = (section_length & 0xFF) as u8;
        section
    }

    fn wrap_in_ts_packets(pid: u16, section: &[u8]) -> Vec<u8> {
        let mut payload = vec![0u8]; // pointer field
        payload.extend_from_slice(section);

        let mut packets = Vec::new();
        let mut cc = 0u8;
        let mut first = true;
        for chunk in payload.chunks(184) {
            let mut packet = vec![0u8; 188];
            packet[0] = SYNC_BYTE;
            packet[1] = if first { 0x40 } else { 0x00 } | ((pid >> 8) as u8 & 0x1F);
            packet[2] = (pid & 0xFF) as u8;
            packet[3] = 0x10 | cc; // payload only, continuity counter
            packet[4..4 + chunk.len()].copy_from_slice(chunk);
            packets.extend_from_slice(&packet);
            cc = (cc + 1) & 0x0F;
            first = false;
        }
        packets
    }

    #[test]
    fn vct_then_eit_resolves_virtual_channel_by_exact_match() {
        let channels = registry_with("15.1", "7", "500000000");
        let mut buffer = wrap_in_ts_packets(pid::ATSC_PSIP, &vct_section(15, 1, 7, 7));
        buffer.extend(wrap_in_ts_packets(
            pid::ATSC_PSIP,
            &atsc_eit_section(7, 1, 1_000_000, 1800, "News"),
        ));

        let output = EpgParser::parse(&channels, "500000000", &buffer);
        assert_eq!(output.upserts.len(), 1);
        assert_eq!(output.upserts[0].channel_service_id, "15.1");
        assert_eq!(output.upserts[0].title, "News");
        assert_eq!(
            output.upserts[0].end_time - output.upserts[0].start_time,
            1_800_000
        );
    }

    #[test]
    fn eit_without_prior_vct_falls_back_to_raw_source_id() {
        let channels = ChannelRegistry::default();
        let buffer = wrap_in_ts_packets(
            pid::ATSC_PSIP,
            &atsc_eit_section(9, 2, 1_000_000, 600, "Weather"),
        );

        let output = EpgParser::parse(&channels, "500000000", &buffer);
        assert_eq!(output.upserts.len(), 1);
        assert_eq!(output.upserts[0].channel_service_id, "9");
    }

    #[test]
    fn gps_start_time_matches_the_spec_formula() {
        let channels = ChannelRegistry::default();
        let buffer =
            wrap_in_ts_packets(pid::ATSC_PSIP, &atsc_eit_section(1, 1, 1_000_000, 60, "X"));

        let output = EpgParser::parse(&channels, "500000000", &buffer);
        let expected = (1_000_000i64 + GPS_UNIX_EPOCH_OFFSET_SECS - GPS_UTC_LEAP_SECONDS) * 1000;
        assert_eq!(output.upserts[0].start_time, expected);
    }

    #[test]
    fn pid_counts_tracks_every_pid_seen_not_just_the_known_two() {
        let channels = ChannelRegistry::default();
        let mut buffer =
            wrap_in_ts_packets(pid::ATSC_PSIP, &atsc_eit_section(1, 1, 1_000_000, 60, "X"));
        buffer.extend(wrap_in_ts_packets(0x1234, &[0u8; 10]));

        let mut parser = EpgParser::new(&channels, "500000000");
        parser.feed(&buffer);
        let counts = parser.pid_counts();
        assert_eq!(counts.get(&pid::ATSC_PSIP), Some(&1));
        assert_eq!(counts.get(&0x1234), Some(&1));
    }

    #[test]
    fn diagnostic_table_range_is_counted() {
        let channels = ChannelRegistry::default();
        let mut section = vec![0u8; 3];
        section[0] = 0xC7; // within ATSC_DIAGNOSTIC_RANGE
        let section_length = section.len() - 3;
        section[1] = ((section_length >> 8) & 0x0F) as u8;
        section[2] = (section_length & 0xFF) as u8;
        let buffer = wrap_in_ts_packets(pid::ATSC_PSIP, &section);

        let mut parser = EpgParser::new(&channels, "500000000");
        parser.feed(&buffer);
        assert_eq!(parser.diagnostic_table_counts().get(&0xC7), Some(&1));
    }

    #[test]
    fn sync_byte_recovery_skips_a_corrupted_prefix() {
        let channels = ChannelRegistry::default();
        let mut buffer = vec![0xFFu8; 5];
        buffer.extend(wrap_in_ts_packets(
            pid::ATSC_PSIP,
            &atsc_eit_section(3, 1, 1_000_000, 30, "Recovered"),
        ));

        let output = EpgParser::parse(&channels, "500000000", &buffer);
        assert_eq!(output.upserts.len(), 1);
        assert_eq!(output.upserts[0].title, "Recovered");
    }

    #[test]
    fn ett_updates_description_for_matching_event_id() {
        let mut section = vec![0u8; 13];
        section[0] = table_id::ATSC_ETT;
        let etm_id: u32 = (7u32 << 16) | (5u32 << 2);
        section[9..13].copy_from_slice(&etm_id.to_be_bytes());
        let mut mss = vec![1u8];
        mss.extend_from_slice(&[b'e', b'n', b'g', 1, 0, 0]);
        mss.push(5);
        mss.extend_from_slice(b"Synop");
        section.extend_from_slice(&mss);
        let section_length = section.len() - 3;
        section[1] = ((section_length >> 8) & 0x0F) as u8;
        section[2] = (section_length & 0xFF) as u8;

        let channels = registry_with("15.1", "7", "500000000");
        let mut buffer = wrap_in_ts_packets(pid::ATSC_PSIP, &vct_section(15, 1, 7, 7));
        buffer.extend(wrap_in_ts_packets(pid::ATSC_PSIP, &section));

        let output = EpgParser::parse(&channels, "500000000", &buffer);
        assert_eq!(output.description_updates.len(), 1);
        assert_eq!(output.description_updates[0].event_id, 5);
        assert_eq!(output.description_updates[0].channel_service_id, "15.1");
        assert_eq!(output.description_updates[0].description, "Synop");
    }

    #[test]
    fn dvb_eit_decodes_mjd_bcd_time_and_descriptors() {
        let channels = registry_with("4.1", "100", "177000000");

        let mut section = vec![0u8; 14];
        section[0] = 0x4E; // present/following EIT
        section[3..5].copy_from_slice(&100u16.to_be_bytes());

        let mjd: u16 = 58849; // 2020-01-15
        let mut event = vec![0u8; 12];
        event[0..2].copy_from_slice(&1u16.to_be_bytes());
        event[2..4].copy_from_slice(&mjd.to_be_bytes());
        event[4] = 0x12; // 12
        event[5] = 0x30; // 30
        event[6] = 0x00; // 00
        event[7] = 0x01; // 1 hour duration
        event[8] = 0x00;
        event[9] = 0x00;

        let mut short_event = vec![b'e', b'n', b'g', 4];
        short_event.extend_from_slice(b"Show");
        short_event.push(0); // text_length = 0

        let mut descriptors = vec![0x4Du8, short_event.len() as u8];
        descriptors.extend_from_slice(&short_event);

        event[10] = ((descriptors.len() >> 8) & 0x0F) as u8;
        event[11] = (descriptors.len() & 0xFF) as u8;

        section.extend_from_slice(&event);
        section.extend_from_slice(&descriptors);
        let section_length = section.len() - 3;
        section[1] = ((section_length >> 8) & 0x0F) as u8;
        section[2] = (section_length & 0xFF) as u8;

        let buffer = wrap_in_ts_packets(pid::DVB_EIT, &section);
        let output = EpgParser::parse(&channels, "177000000", &buffer);

        assert_eq!(output.upserts.len(), 1);
        assert_eq!(output.upserts[0].channel_service_id, "4.1");
        assert_eq!(output.upserts[0].title, "Show");
        assert_eq!(
            output.upserts[0].end_time - output.upserts[0].start_time,
            3_600_000
        );
    }
}
