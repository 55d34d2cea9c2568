//! Boundary to the external description extractor.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::diff::diff_descriptions;
use crate::types::{Description, ExtractionError, Verdict};

/// External capability that describes images and judges whether two
/// descriptions carry the same meaning.
#[async_trait]
pub trait DescriptionExtractor: Send + Sync {
    /// Produce a structured description of the encoded image.
    async fn extract(&self, image: &[u8]) -> Result<Description, ExtractionError>;

    /// Decide whether `current` means the same as `previous`.
    ///
    /// The default treats descriptions as the same when their structured diff
    /// is empty.
    async fn compare(
        &self,
        previous: &Description,
        current: &Description,
    ) -> Result<Verdict, ExtractionError> {
        Ok(if diff_descriptions(previous, current).is_empty() {
            Verdict::Same
        } else {
            Verdict::Different
        })
    }
}

impl Description {
    /// Reject extractor output that cannot be stored as a description.
    pub fn validate(&self) -> Result<(), ExtractionError> {
        let text = self.text.trim();
        if text.is_empty() {
            return Err(ExtractionError::Malformed("description text is empty".into()));
        }

        let visible: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
        let symbols = visible.iter().filter(|c| !c.is_alphanumeric()).count();
        if symbols * 2 > visible.len() {
            return Err(ExtractionError::Malformed(
                "description text is mostly symbols".into(),
            ));
        }

        let words: Vec<&str> = text.split_whitespace().collect();
        if words.len() > 10 {
            let unique: HashSet<&str> = words.iter().copied().collect();
            if unique.len() * 10 < words.len() * 3 {
                return Err(ExtractionError::Malformed(
                    "description text is repetitive".into(),
                ));
            }
        }

        if self.tags.iter().any(|t| t.trim().is_empty()) {
            return Err(ExtractionError::Malformed("description has an empty tag".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    #[async_trait]
    impl DescriptionExtractor for Fixed {
        async fn extract(&self, _image: &[u8]) -> Result<Description, ExtractionError> {
            Ok(Description::new("fixed"))
        }
    }

    #[tokio::test]
    async fn test_default_compare() {
        let a = Description::new("settings page").with_tags(["ui"]);
        let same = Description::new("settings page ").with_tags(["UI"]);
        let different = Description::new("settings page, dark mode");
        assert_eq!(Fixed.compare(&a, &same).await.unwrap(), Verdict::Same);
        assert_eq!(Fixed.compare(&a, &different).await.unwrap(), Verdict::Different);
    }

    #[test]
    fn test_validate_accepts_normal_text() {
        let d = Description::new("A dashboard showing revenue by region for Q3.").with_tags(["chart"]);
        assert!(d.validate().is_ok());
    }

    #[test]
    fn test_validate_rejections() {
        let cases = [
            Description::new("   "),
            Description::new("#$%^&*()!! ab"),
            Description::new("spam spam spam spam spam spam spam spam spam spam spam eggs"),
            Description::new("fine text").with_tags(["ok", " "]),
        ];
        for d in cases {
            assert!(
                matches!(d.validate(), Err(ExtractionError::Malformed(_))),
                "expected rejection for {d:?}"
            );
        }
    }
}
