use serde::{Deserialize, Serialize};

/// Address fields after trimming and joining, ready for cache comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedAddress {
    pub address_line: String,
    pub city: String,
}

impl NormalizedAddress {
    /// Lower-cased view used when comparing against cached locations.
    pub fn match_key(&self, postal_code: i64) -> MatchKey {
        MatchKey::new(&self.address_line, &self.city, postal_code)
    }
}

/// The `(address, city, postal code)` triple a cached location is found by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchKey {
    pub address_line: String,
    pub city: String,
    pub postal_code: i64,
}

impl MatchKey {
    pub fn new(address_line: &str, city: &str, postal_code: i64) -> Self {
        Self {
            address_line: address_line.to_lowercase(),
            city: city.to_lowercase(),
            postal_code,
        }
    }
}

/// Trims each address line and joins the optional second line onto the first
/// with a single space. A blank second line counts as absent. Case is preserved
/// here; `MatchKey` folds it.
pub fn normalize(address_line1: &str, address_line2: Option<&str>, city: &str) -> NormalizedAddress {
    let mut address_line = address_line1.trim().to_string();
    if let Some(second) = address_line2.map(str::trim).filter(|s| !s.is_empty()) {
        address_line.push(' ');
        address_line.push_str(second);
    }
    NormalizedAddress {
        address_line,
        city: city.trim().to_string(),
    }
}
