//! XMLTV document generator: channel list plus programmes with `end_time > now`.
//!
//! Hand-written XML, not a crate: the document shape is small and fixed (two elements,
//! a handful of attributes), not worth a dependency.

use chrono::{TimeZone, Utc};

use crate::channel::ChannelRegistry;
use crate::epg::ProgramRow;

pub fn build(channels: &ChannelRegistry, programs: &[ProgramRow], now: i64) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<tv>\n");

    for channel in channels.all() {
        out.push_str(&format!("  <channel id=\"{}\">\n", escape(&channel.number)));
        out.push_str(&format!(
            "    <display-name>{}</display-name>\n",
            escape(&channel.name)
        ));
        if let Some(icon) = &channel.icon_url {
            out.push_str(&format!("    <icon src=\"{}\"/>\n", escape(icon)));
        }
        out.push_str("  </channel>\n");
    }

    for program in programs {
        if program.end_time <= now {
            continue;
        }
        out.push_str(&format!(
            "  <programme start=\"{}\" stop=\"{}\" channel=\"{}\">\n",
            xmltv_timestamp(program.start_time),
            xmltv_timestamp(program.end_time),
            escape(&program.channel_service_id),
        ));
        out.push_str(&format!("    <title>{}</title>\n", escape(&program.title)));
        if !program.description.is_empty() {
            out.push_str(&format!(
                "    <desc>{}</desc>\n",
                escape(&program.description)
            ));
        }
        out.push_str("  </programme>\n");
    }

    out.push_str("</tv>\n");
    out
}

fn xmltv_timestamp(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|dt| dt.format("%Y%m%d%H%M%S +0000").to_string())
        .unwrap_or_else(|| "19700101000000 +0000".to_string())
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
