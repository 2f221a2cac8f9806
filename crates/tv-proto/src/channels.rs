use serde::{Deserialize, Serialize};

/// One entry in the programming lineup.
///
/// `media` is both the locator handed to the player backend (URL or file
/// path) and the key under which resume progress is stored.  Two channels may
/// point at the same media; they then share a resume position, which is the
/// intended behaviour (think of a rerun on a second channel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    pub media: String,
}

/// Immutable ordered channel lineup with wraparound index arithmetic.
/// Channel identity is its position in the lineup.
#[derive(Debug, Clone)]
pub struct ChannelRegistry {
    channels: Vec<Channel>,
}

impl ChannelRegistry {
    /// An empty lineup is a configuration error, not a runtime state — every
    /// other method can therefore assume at least one channel.
    pub fn new(channels: Vec<Channel>) -> anyhow::Result<Self> {
        if channels.is_empty() {
            anyhow::bail!("channel lineup is empty");
        }
        Ok(Self { channels })
    }

    pub fn get(&self, index: usize) -> &Channel {
        &self.channels[index]
    }

    pub fn count(&self) -> usize {
        self.channels.len()
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn next_index(&self, index: usize) -> usize {
        (index + 1) % self.channels.len()
    }

    pub fn previous_index(&self, index: usize) -> usize {
        (index + self.channels.len() - 1) % self.channels.len()
    }

    /// Validates a persisted index against the current lineup.  Out-of-range
    /// or absent values fall back to the first channel — the lineup may have
    /// shrunk since the index was saved.
    pub fn clamp_index(&self, saved: Option<usize>) -> usize {
        match saved {
            Some(i) if i < self.channels.len() => i,
            _ => 0,
        }
    }
}

// ── TOML lineup loader ────────────────────────────────────────────────────────

/// Intermediate struct matching the TOML `[[channel]]` table.  Kept separate
/// from `Channel` so the file schema can diverge from the wire struct without
/// breaking either.
#[derive(Debug, Deserialize)]
struct TomlChannelFile {
    channel: Vec<TomlChannel>,
}

#[derive(Debug, Deserialize)]
struct TomlChannel {
    name: String,
    media: String,
}

pub fn parse_channels_from_toml_str(content: &str) -> anyhow::Result<Vec<Channel>> {
    let file: TomlChannelFile = toml::from_str(content)?;
    Ok(file
        .channel
        .into_iter()
        .map(|c| Channel {
            name: c.name,
            media: c.media,
        })
        .collect())
}

pub fn load_channels_from_toml(path: &std::path::Path) -> anyhow::Result<Vec<Channel>> {
    let content = std::fs::read_to_string(path)?;
    parse_channels_from_toml_str(&content)
}

/// Demo lineup written out on first run when no channels file exists yet
/// (public-domain Blender shorts, so the TV works out of the box).
pub const DEFAULT_CHANNELS_TOML: &str = r#"# televizor channel lineup — edit to taste.
# Each [[channel]] pairs a display name with a media URL or file path.

[[channel]]
name = "Cartoons"
media = "http://commondatastorage.googleapis.com/gtv-videos-bucket/sample/BigBuckBunny.mp4"

[[channel]]
name = "Late Movie"
media = "http://commondatastorage.googleapis.com/gtv-videos-bucket/sample/ElephantsDream.mp4"

[[channel]]
name = "Fantasy"
media = "http://commondatastorage.googleapis.com/gtv-videos-bucket/sample/Sintel.mp4"

[[channel]]
name = "Sci-Fi"
media = "http://commondatastorage.googleapis.com/gtv-videos-bucket/sample/TearsOfSteel.mp4"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn lineup(n: usize) -> ChannelRegistry {
        let channels = (0..n)
            .map(|i| Channel {
                name: format!("ch{i}"),
                media: format!("media{i}"),
            })
            .collect();
        ChannelRegistry::new(channels).unwrap()
    }

    #[test]
    fn test_empty_lineup_rejected() {
        assert!(ChannelRegistry::new(Vec::new()).is_err());
    }

    #[test]
    fn test_wraparound_is_a_bijection() {
        for count in [1, 2, 3, 8] {
            let registry = lineup(count);
            for i in 0..count {
                assert_eq!(registry.next_index(registry.previous_index(i)), i);
                assert_eq!(registry.previous_index(registry.next_index(i)), i);
            }
        }
    }

    #[test]
    fn test_wraparound_edges() {
        let registry = lineup(3);
        assert_eq!(registry.next_index(2), 0);
        assert_eq!(registry.previous_index(0), 2);
    }

    #[test]
    fn test_clamp_index() {
        let registry = lineup(3);
        assert_eq!(registry.clamp_index(None), 0);
        assert_eq!(registry.clamp_index(Some(2)), 2);
        assert_eq!(registry.clamp_index(Some(3)), 0);
        assert_eq!(registry.clamp_index(Some(usize::MAX)), 0);
    }

    #[test]
    fn test_parse_toml_lineup() {
        let channels = parse_channels_from_toml_str(DEFAULT_CHANNELS_TOML).unwrap();
        assert_eq!(channels.len(), 4);
        assert_eq!(channels[0].name, "Cartoons");
        assert!(channels[0].media.starts_with("http"));
    }

    #[test]
    fn test_duplicate_media_allowed() {
        let channels = parse_channels_from_toml_str(
            r#"
            [[channel]]
            name = "Ads"
            media = "ads.mp4"

            [[channel]]
            name = "More Ads"
            media = "ads.mp4"
            "#,
        )
        .unwrap();
        let registry = ChannelRegistry::new(channels).unwrap();
        assert_eq!(registry.get(0).media, registry.get(1).media);
    }
}
