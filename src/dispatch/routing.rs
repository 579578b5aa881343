use std::collections::BTreeMap;

use crate::config::RoutingConfig;
use crate::model::{Category, Classification};

/// Category to backend-id table
#[derive(Debug, Clone)]
pub struct Routing {
    default: Vec<String>,
    categories: BTreeMap<Category, Vec<String>>,
}

impl Routing {
    pub fn new(config: &RoutingConfig) -> Self {
        Self {
            default: config.default.clone(),
            categories: config.categories.clone(),
        }
    }

    /// Backend ids for a classification; categories without an entry use the default list
    pub fn backends_for(&self, classification: &Classification) -> &[String] {
        self.categories
            .get(&classification.category)
            .unwrap_or(&self.default)
    }

    pub fn routes_anywhere(&self, classification: &Classification) -> bool {
        !self.backends_for(classification).is_empty()
    }
}

impl Default for Routing {
    fn default() -> Self {
        Self::new(&RoutingConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContentKind;

    fn class(category: Category) -> Classification {
        Classification {
            category,
            content: ContentKind::Unprobed,
            oversized: false,
        }
    }

    #[test]
    fn test_default_routes() {
        let routing = Routing::default();
        assert_eq!(
            routing.backends_for(&class(Category::EnvFile)),
            ["custom-rules".to_string(), "trufflehog".to_string()]
        );
        assert!(!routing.routes_anywhere(&class(Category::Media)));
        assert!(!routing.routes_anywhere(&class(Category::CompiledArtifact)));
    }

    #[test]
    fn test_category_override() {
        let mut config = RoutingConfig::default();
        config
            .categories
            .insert(Category::Document, vec!["custom-rules".to_string()]);
        let routing = Routing::new(&config);
        assert_eq!(routing.backends_for(&class(Category::Document)), ["custom-rules".to_string()]);
        assert_eq!(routing.backends_for(&class(Category::Source)).len(), 2);
    }
}
