//! Market location registry.
//!
//! The order feed identifies markets by numeric code (e.g. `3005`), the aggregate-price
//! API by city name (e.g. `"Caerleon"`). Both resolve to one canonical [`Location`].

use std::collections::{HashMap, HashSet};

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Location {
    pub id: u32,
    pub name: String,
}

/// Built-in market locations: (feed code, API name).
/// Portal markets share their parent city's API name and are folded into it.
const BUILTIN: &[(u32, &str)] = &[
    (7, "Thetford"),
    (1002, "Lymhurst"),
    (2004, "Bridgewatch"),
    (3003, "Black Market"),
    (3005, "Caerleon"),
    (3008, "Martlock"),
    (4002, "Fort Sterling"),
    (5003, "Brecilien"),
];

/// Portal market codes → parent city code.
const PORTALS: &[(u32, u32)] = &[
    (301, 7),
    (1301, 1002),
    (2301, 2004),
    (3301, 3008),
    (4301, 4002),
];

#[derive(Debug, Clone)]
pub struct LocationRegistry {
    by_id: HashMap<u32, Location>,
    by_name: HashMap<String, u32>,
    aliases: HashMap<u32, u32>,
    disallowed: HashSet<u32>,
}

impl LocationRegistry {
    /// Registry of built-in markets. `disallowed` are names or codes of locations that
    /// routes must not pass through; unknown entries are returned in `Err`.
    pub fn new(disallowed: &[String]) -> std::result::Result<Self, Vec<String>> {
        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();
        for &(id, name) in BUILTIN {
            by_id.insert(id, Location { id, name: name.to_string() });
            by_name.insert(normalize(name), id);
        }
        let aliases: HashMap<u32, u32> = PORTALS.iter().copied().collect();

        let mut registry = Self {
            by_id,
            by_name,
            aliases,
            disallowed: HashSet::new(),
        };

        let mut unknown = Vec::new();
        for entry in disallowed {
            match registry.resolve_any(entry) {
                Some(id) => {
                    registry.disallowed.insert(id);
                }
                None => unknown.push(entry.clone()),
            }
        }
        if unknown.is_empty() {
            Ok(registry)
        } else {
            Err(unknown)
        }
    }

    /// Resolve a feed location code. Portal codes fold into their city.
    pub fn resolve_code(&self, code: u32) -> Option<u32> {
        let id = self.aliases.get(&code).copied().unwrap_or(code);
        self.by_id.contains_key(&id).then_some(id)
    }

    /// Resolve an API city name (case and whitespace insensitive).
    pub fn resolve_name(&self, name: &str) -> Option<u32> {
        self.by_name.get(&normalize(name)).copied()
    }

    /// Resolve either a numeric code or a city name.
    pub fn resolve_any(&self, s: &str) -> Option<u32> {
        match s.trim().parse::<u32>() {
            Ok(code) => self.resolve_code(code),
            Err(_) => self.resolve_name(s),
        }
    }

    pub fn name(&self, id: u32) -> String {
        self.by_id
            .get(&id)
            .map(|l| l.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    pub fn is_disallowed(&self, id: u32) -> bool {
        self.disallowed.contains(&id)
    }

    /// All locations sorted by code.
    pub fn all(&self) -> Vec<Location> {
        let mut all: Vec<Location> = self.by_id.values().cloned().collect();
        all.sort_by_key(|l| l.id);
        all
    }

    /// City names in the form the aggregate-price API expects, sorted by code.
    pub fn api_names(&self) -> Vec<String> {
        self.all().into_iter().map(|l| l.name).collect()
    }
}

fn normalize(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_codes_names_and_portals() {
        let reg = LocationRegistry::new(&[]).unwrap();
        assert_eq!(reg.resolve_code(3005), Some(3005));
        assert_eq!(reg.resolve_code(1301), Some(1002));
        assert_eq!(reg.resolve_name("fort  sterling"), Some(4002));
        assert_eq!(reg.resolve_any("0007"), Some(7));
        assert_eq!(reg.resolve_code(9999), None);
        assert_eq!(reg.name(2004), "Bridgewatch");
    }

    #[test]
    fn disallowed_accepts_names_and_codes() {
        let reg = LocationRegistry::new(&["Caerleon".to_string(), "3003".to_string()]).unwrap();
        assert!(reg.is_disallowed(3005));
        assert!(reg.is_disallowed(3003));
        assert!(!reg.is_disallowed(7));
    }

    #[test]
    fn unknown_disallowed_entry_is_reported() {
        let err = LocationRegistry::new(&["Atlantis".to_string()]).unwrap_err();
        assert_eq!(err, vec!["Atlantis".to_string()]);
    }
}
