//! Extended M3U rendering for the live-channel playlist.
use crate::protocol::PlaylistEntry;

/// Render the playlist body.  Entries are written in the order given.
pub fn render_m3u(entries: &[PlaylistEntry], group_title: &str) -> String {
    let mut out = String::from("#EXTM3U\n");
    for entry in entries {
        let name = sanitize_attr(&entry.name);
        out.push_str(&format!(
            "#EXTINF:-1 tvg-id=\"{}\" tvg-name=\"{}\" group-title=\"{}\",{}\n",
            entry.channel_id,
            name,
            sanitize_attr(group_title),
            name
        ));
        out.push_str(&entry.output_url);
        out.push('\n');
    }
    out
}

fn sanitize_attr(value: &str) -> String {
    value.replace('"', "'").replace(['\r', '\n'], " ")
}

/// Parse a playlist produced by [`render_m3u`] back into entries.
///
/// Unknown tags are skipped; a URL without a preceding `#EXTINF` gets the URL
/// itself as its name and channel id 0.
pub fn parse_m3u_from_str(content: &str) -> Vec<PlaylistEntry> {
    let mut entries = Vec::new();
    let mut pending: Option<(u32, String)> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            // The display name follows the first comma after the last attribute.
            let attrs_end = rest.rfind('"').map(|q| q + 1).unwrap_or(0);
            if let Some(comma_idx) = rest[attrs_end..].find(',').map(|i| i + attrs_end) {
                let name = rest[comma_idx + 1..].trim().to_string();
                let id = attr_value(&rest[..comma_idx], "tvg-id")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                pending = Some((id, name));
            }
            continue;
        }

        if line.starts_with('#') {
            continue;
        }

        let output_url = line.to_string();
        let (channel_id, name) = pending.take().unwrap_or_else(|| (0, output_url.clone()));
        entries.push(PlaylistEntry {
            channel_id,
            name,
            output_url,
        });
    }

    entries
}

fn attr_value<'a>(attrs: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("{}=\"", key);
    let start = attrs.find(&needle)? + needle.len();
    let len = attrs[start..].find('"')?;
    Some(&attrs[start..start + len])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u32, name: &str) -> PlaylistEntry {
        PlaylistEntry {
            channel_id: id,
            name: name.to_string(),
            output_url: format!("http://host/hls/{}-{}.m3u8", name.to_lowercase(), id),
        }
    }

    #[test]
    fn test_render_empty() {
        assert_eq!(render_m3u(&[], "Signage"), "#EXTM3U\n");
    }

    #[test]
    fn test_render_entries() {
        let body = render_m3u(&[entry(1, "Lobby"), entry(7, "Bar")], "Signage");
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(
            lines[1],
            "#EXTINF:-1 tvg-id=\"1\" tvg-name=\"Lobby\" group-title=\"Signage\",Lobby"
        );
        assert_eq!(lines[2], "http://host/hls/lobby-1.m3u8");
        assert!(lines[3].starts_with("#EXTINF:-1 tvg-id=\"7\""));
    }

    #[test]
    fn test_parse_rendered_playlist() {
        let entries = vec![entry(2, "Hall, East"), entry(3, "Door")];
        let parsed = parse_m3u_from_str(&render_m3u(&entries, "G"));
        assert_eq!(parsed, entries);
    }

    #[test]
    fn test_parse_bare_url() {
        let parsed = parse_m3u_from_str("#EXTM3U\nhttp://x/y.m3u8\n");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].channel_id, 0);
        assert_eq!(parsed[0].name, "http://x/y.m3u8");
    }
}
