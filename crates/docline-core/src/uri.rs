//! Destination keys built from record identifiers

use crate::config::LoaderConfig;

/// Turns a raw identifier into the key a record is stored under:
/// `prefix [basename/] escaped-id suffix`.
#[derive(Debug, Clone, Default)]
pub struct KeyBuilder {
    prefix: String,
    suffix: String,
    strip: Option<String>,
    escape: bool,
    normalize: bool,
    use_basename: bool,
}

impl KeyBuilder {
    pub fn from_config(config: &LoaderConfig) -> Self {
        Self {
            prefix: config.uri_prefix.clone(),
            suffix: config.uri_suffix.clone(),
            strip: config.strip_prefix.clone().filter(|s| !s.is_empty()),
            escape: config.escape_uris,
            normalize: config.normalize_paths,
            use_basename: config.use_filename_path,
        }
    }

    pub fn key(&self, id: &str, basename: Option<&str>) -> String {
        let id = match &self.strip {
            Some(strip) => id.strip_prefix(strip.as_str()).unwrap_or(id),
            None => id,
        };
        let mut key = String::with_capacity(self.prefix.len() + id.len() + self.suffix.len() + 16);
        key.push_str(&self.prefix);
        if self.use_basename {
            if let Some(base) = basename.filter(|b| !b.is_empty()) {
                key.push_str(&self.path(base));
                key.push('/');
            }
        }
        key.push_str(&self.path(id));
        key.push_str(&self.suffix);
        key
    }

    /// Normalise separators and escape each segment, keeping `/` intact.
    fn path(&self, raw: &str) -> String {
        let normalized = if self.normalize {
            raw.replace('\\', "/")
        } else {
            raw.to_string()
        };
        if !self.escape {
            return normalized;
        }
        normalized
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }
}
