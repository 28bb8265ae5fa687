//! M3U playlist generator: one entry per configured channel, linking to `/stream/:num`.

use crate::channel::ChannelRegistry;

/// Build the M3U document. `container`/`codec` are appended as `?f=&c=` on each stream URL
/// when present, so players get the selectors without needing their own UI for them.
pub fn build(
    channels: &ChannelRegistry,
    base_url: &str,
    container: Option<&str>,
    codec: Option<&str>,
) -> String {
    let mut out = String::from("#EXTM3U\n");

    let mut query = String::new();
    if let Some(f) = container {
        query.push_str(&format!("f={f}"));
    }
    if let Some(c) = codec {
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!("c={c}"));
    }

    for channel in channels.all() {
        out.push_str(&format!(
            "#EXTINF:-1 tvg-id=\"{number}\" tvg-chno=\"{number}\"{logo},{name}\n",
            number = channel.number,
            name = channel.name,
            logo = channel
                .icon_url
                .as_deref()
                .map(|url| format!(" tvg-logo=\"{url}\""))
                .unwrap_or_default(),
        ));
        if query.is_empty() {
            out.push_str(&format!("{base_url}/stream/{}\n", channel.number));
        } else {
            out.push_str(&format!("{base_url}/stream/{}?{query}\n", channel.number));
        }
    }

    out
}
