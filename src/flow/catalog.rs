use serde::Deserialize;

/// One selectable backend model and what a generation with it costs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageModel {
    pub key: String,
    pub name: String,
    pub model: String,
    pub price: i64,
}

impl ImageModel {
    pub fn new(key: &str, name: &str, model: &str, price: i64) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            model: model.to_string(),
            price,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models: Vec<ImageModel>,
}

impl ModelCatalog {
    /// Builds a catalog, falling back to the built-in models when `models` is empty.
    pub fn new(models: Vec<ImageModel>) -> Self {
        if models.is_empty() {
            return Self::builtin();
        }
        Self { models }
    }

    pub fn builtin() -> Self {
        Self {
            models: vec![
                ImageModel::new(
                    "nano-banana",
                    "Nano-Banana",
                    "google/gemini-2.5-flash-image",
                    10,
                ),
                ImageModel::new(
                    "nano-banana-pro",
                    "Nano-Banana Pro",
                    "google/gemini-3-pro-image-preview",
                    25,
                ),
                ImageModel::new("seedream-4", "SeeDream 4.0", "bytedance/seedream-4", 15),
                ImageModel::new(
                    "seedream-4.5",
                    "SeeDream 4.5",
                    "bytedance-seed/seedream-4.5",
                    20,
                ),
            ],
        }
    }

    pub fn models(&self) -> &[ImageModel] {
        &self.models
    }

    pub fn default_model(&self) -> &ImageModel {
        &self.models[0]
    }

    pub fn get(&self, key: &str) -> Option<&ImageModel> {
        self.models.iter().find(|model| model.key == key)
    }

    /// Resolves an account's stored selection; unknown or missing keys map to the default.
    pub fn resolve(&self, key: Option<&str>) -> &ImageModel {
        key.and_then(|key| self.get(key))
            .unwrap_or_else(|| self.default_model())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AspectFormat {
    #[default]
    Square,
    Portrait,
    Vertical,
    Wide,
    Original,
}

impl AspectFormat {
    pub const ALL: [AspectFormat; 5] = [
        AspectFormat::Square,
        AspectFormat::Portrait,
        AspectFormat::Vertical,
        AspectFormat::Wide,
        AspectFormat::Original,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            AspectFormat::Square => "1:1",
            AspectFormat::Portrait => "2:3",
            AspectFormat::Vertical => "9:16",
            AspectFormat::Wide => "16:9",
            AspectFormat::Original => "original",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|format| format.tag().eq_ignore_ascii_case(tag.trim()))
    }

    pub fn label(self) -> &'static str {
        match self {
            AspectFormat::Square => "1:1 Square",
            AspectFormat::Portrait => "2:3 Portrait",
            AspectFormat::Vertical => "9:16 Vertical",
            AspectFormat::Wide => "16:9 Wide",
            AspectFormat::Original => "Original",
        }
    }

    /// Aspect ratio hint for the provider. `Original` leaves the choice to the model.
    pub fn aspect_ratio(self) -> Option<&'static str> {
        match self {
            AspectFormat::Original => None,
            other => Some(other.tag()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_falls_back_to_default_for_unknown_keys() {
        let catalog = ModelCatalog::builtin();
        assert_eq!(catalog.resolve(Some("missing")).key, "nano-banana");
        assert_eq!(catalog.resolve(None).key, "nano-banana");
        assert_eq!(catalog.resolve(Some("seedream-4.5")).name, "SeeDream 4.5");
    }

    #[test]
    fn empty_catalog_uses_builtin_models() {
        let catalog = ModelCatalog::new(Vec::new());
        assert_eq!(catalog.models().len(), 4);
    }

    #[test]
    fn format_tags_parse_back() {
        for format in AspectFormat::ALL {
            assert_eq!(AspectFormat::from_tag(format.tag()), Some(format));
        }
        assert_eq!(AspectFormat::from_tag("ORIGINAL"), Some(AspectFormat::Original));
        assert_eq!(AspectFormat::from_tag("4:3"), None);
        assert_eq!(AspectFormat::Original.aspect_ratio(), None);
    }
}
