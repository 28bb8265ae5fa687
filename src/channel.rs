//! Channel data model and channels-config file parsing.
//!
//! The channels-config format is INI-like: sections headed by `[Name]`, each with
//! `SERVICE_ID`, `VCHANNEL`, and `FREQUENCY` keys. Duplicate section names are permitted;
//! disambiguation is always by `VCHANNEL`, never by the section name.

use std::collections::HashSet;
use std::path::Path;

/// A tunable virtual service. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    /// Stable tuning key, e.g. `"55.1"`. This, not `name`, is what's passed to the demodulator.
    pub number: String,
    pub name: String,
    pub service_id: String,
    pub frequency: String,
    pub icon_url: Option<String>,
}

/// The immutable, load-once collection of channels for a run.
#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    channels: Vec<Channel>,
}

impl ChannelRegistry {
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(Self::parse(&contents))
    }

    /// Parse the INI-like channels-config format described in the external interfaces contract.
    pub fn parse(contents: &str) -> Self {
        let mut channels = Vec::new();
        let mut current_name: Option<String> = None;
        let mut service_id = String::new();
        let mut vchannel = String::new();
        let mut frequency = String::new();

        let flush = |name: &Option<String>,
                     service_id: &str,
                     vchannel: &str,
                     frequency: &str,
                     out: &mut Vec<Channel>| {
            if let Some(name) = name {
                if !vchannel.is_empty() {
                    out.push(Channel {
                        number: vchannel.to_string(),
                        name: name.clone(),
                        service_id: normalize_service_id(service_id),
                        frequency: frequency.to_string(),
                        icon_url: None,
                    });
                }
            }
        };

        for raw_line in contents.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                flush(
                    &current_name,
                    &service_id,
                    &vchannel,
                    &frequency,
                    &mut channels,
                );
                current_name = Some(line[1..line.len() - 1].trim().to_string());
                service_id.clear();
                vchannel.clear();
                frequency.clear();
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim().to_ascii_uppercase();
            let value = value.trim().to_string();
            match key.as_str() {
                "SERVICE_ID" => service_id = value,
                "VCHANNEL" => vchannel = value,
                "FREQUENCY" => frequency = value,
                _ => {}
            }
        }
        flush(
            &current_name,
            &service_id,
            &vchannel,
            &frequency,
            &mut channels,
        );

        Self { channels }
    }

    pub fn find(&self, number: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.number == number)
    }

    pub fn all(&self) -> &[Channel] {
        &self.channels
    }

    /// The set of distinct frequencies, used by the EPG orchestrator's per-frequency loop.
    pub fn distinct_frequencies(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for channel in &self.channels {
            if seen.insert(channel.frequency.clone()) {
                out.push(channel.frequency.clone());
            }
        }
        out
    }
}

/// `SERVICE_ID` may be decimal or `0x`-prefixed hex; normalise to a canonical decimal string
/// so joins elsewhere in the system are exact string equality (§9 design notes).
fn normalize_service_id(raw: &str) -> String {
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
            .map(|v| v.to_string())
            .unwrap_or_else(|_| raw.to_string())
    } else {
        raw.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_channel() {
        let registry = ChannelRegistry::parse(
            "[NewsNet]\nSERVICE_ID = 7\nVCHANNEL = 15.1\nFREQUENCY = 500000000\n",
        );
        let channel = registry.find("15.1").expect("channel present");
        assert_eq!(channel.name, "NewsNet");
        assert_eq!(channel.service_id, "7");
        assert_eq!(channel.frequency, "500000000");
    }

    #[test]
    fn normalizes_hex_service_id() {
        let registry = ChannelRegistry::parse(
            "[Hex]\nSERVICE_ID = 0x10\nVCHANNEL = 4.1\nFREQUENCY = 177000000\n",
        );
        assert_eq!(registry.find("4.1").unwrap().service_id, "16");
    }

    #[test]
    fn duplicate_section_names_disambiguated_by_vchannel() {
        let registry = ChannelRegistry::parse(
            "[Bounce]\nSERVICE_ID = 1\nVCHANNEL = 55.2\nFREQUENCY = 1\n\
             [Bounce]\nSERVICE_ID = 2\nVCHANNEL = 55.3\nFREQUENCY = 1\n",
        );
        assert_eq!(registry.all().len(), 2);
        assert_eq!(registry.find("55.2").unwrap().service_id, "1");
        assert_eq!(registry.find("55.3").unwrap().service_id, "2");
        // The tuning key is the number, never the shared section name.
        assert_eq!(registry.find("55.2").unwrap().name, "Bounce");
        assert_eq!(registry.find("55.3").unwrap().name, "Bounce");
    }

    #[test]
    fn distinct_frequencies_deduplicated() {
        let registry = ChannelRegistry::parse(
            "[A]\nSERVICE_ID=1\nVCHANNEL=1.1\nFREQUENCY=100\n\
             [B]\nSERVICE_ID=2\nVCHANNEL=1.2\nFREQUENCY=100\n\
             [C]\nSERVICE_ID=3\nVCHANNEL=2.1\nFREQUENCY=200\n",
        );
        assert_eq!(registry.distinct_frequencies(), vec!["100", "200"]);
    }
}
