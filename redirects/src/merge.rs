use crate::document::Document;
use bred_core::UrlPair;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    Added,
    Duplicate,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MergeResult {
    pub added: usize,
    pub outcomes: Vec<(UrlPair, Outcome)>,
}

impl MergeResult {
    pub fn duplicates(&self) -> usize {
        self.outcomes.len() - self.added
    }
}

/// Append every pair that the document does not already contain.
///
/// Pairs are processed in order, so a pair repeated in the input is only
/// added the first time.
pub fn merge(document: &mut Document, pairs: &[UrlPair]) -> MergeResult {
    let mut result = MergeResult::default();

    for pair in pairs {
        let outcome = if document.contains(pair) {
            log::info!("Redirect already exists: {} -> {}", pair.old_url, pair.new_url);
            Outcome::Duplicate
        } else {
            if document.contains_key(&pair.old_url) {
                log::warn!(
                    "Adding a second redirect for {} (to {})",
                    pair.old_url,
                    pair.new_url
                );
            }

            document.append(pair.clone());
            result.added += 1;
            log::debug!("Redirect added: {} -> {}", pair.old_url, pair.new_url);
            Outcome::Added
        };

        result.outcomes.push((pair.clone(), outcome));
    }

    result
}
