use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::Rng;

use crate::config::EngineConfig;
use crate::models::FakeAttribution;
use crate::utils::html::escape_html;

/// Assigns research-blinding pseudonyms to displayed rationales.
#[derive(Debug, Clone, Default)]
pub struct FakeAttributionService {
    usernames: Vec<String>,
    countries: Vec<String>,
}

impl FakeAttributionService {
    pub fn new(usernames: Vec<String>, countries: Vec<String>) -> Self {
        Self {
            usernames,
            countries,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.fake_usernames.clone(), config.fake_countries.clone())
    }

    /// Attribution is skipped entirely when either pool is empty
    pub fn is_configured(&self) -> bool {
        !self.usernames.is_empty() && !self.countries.is_empty()
    }

    /// Draws one (username, country) per candidate from `rng`, in the given order.
    ///
    /// Must be called with the same generator that produced the selection so the
    /// mapping is reproducible for the cycle.
    pub fn attribute(
        &self,
        candidate_ids: &[String],
        rng: &mut StdRng,
    ) -> BTreeMap<String, FakeAttribution> {
        let mut attributions = BTreeMap::new();
        if !self.is_configured() {
            return attributions;
        }

        for id in candidate_ids {
            if attributions.contains_key(id) {
                continue;
            }
            let username = &self.usernames[rng.random_range(0..self.usernames.len())];
            let country = &self.countries[rng.random_range(0..self.countries.len())];
            attributions.insert(
                id.clone(),
                FakeAttribution {
                    username: username.clone(),
                    country: country.clone(),
                },
            );
        }

        attributions
    }
}

/// HTML for a rationale, annotated with its pseudonym when one was assigned.
pub fn render_rationale(text: &str, attribution: Option<&FakeAttribution>) -> String {
    match attribution {
        Some(attribution) => format!(
            "<i>{}</i> ({}): {}",
            escape_html(&attribution.username),
            escape_html(&attribution.country),
            escape_html(text)
        ),
        None => escape_html(text),
    }
}
