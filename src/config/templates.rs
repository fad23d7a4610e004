//! Built-in configuration templates
//!
//! A template seeds a new configuration for a well-known peer. Matching is
//! either by name or by a device fingerprint reported during discovery.

use std::collections::BTreeMap;

use crate::config::peer::ConfigMap;

/// A well-known default configuration
pub struct Template {
	pub name: &'static str,
	pub description: &'static str,
	/// substrings of device names this template is known to fit
	pub fingerprints: &'static [&'static str],
	/// (outer key, property, value) triples applied over the defaults
	properties: &'static [(&'static str, &'static str, &'static str)],
}

impl Template {
	/// Match quality against a device fingerprint, 0 (no match) to 5
	pub fn score(&self, fingerprint: &str) -> u32 {
		let fp = fingerprint.to_lowercase();
		if self.name.eq_ignore_ascii_case(fingerprint) {
			return 5;
		}
		for candidate in self.fingerprints {
			let c = candidate.to_lowercase();
			if fp == c {
				return 5;
			}
			if fp.contains(&c) || c.contains(&fp) {
				return 3;
			}
		}
		0
	}

	/// Render the template as a config map (includes metadata keys)
	pub fn to_map(&self) -> ConfigMap {
		let mut map = ConfigMap::new();
		map.insert(String::new(), BTreeMap::new());
		for (outer, key, value) in self.properties {
			map.entry(outer.to_string())
				.or_default()
				.insert(key.to_string(), value.to_string());
		}
		let global = map.entry(String::new()).or_default();
		global.insert("templateName".to_string(), self.name.to_string());
		global.insert("description".to_string(), self.description.to_string());
		map
	}
}

static TEMPLATES: &[Template] = &[
	Template {
		name: "default",
		description: "generic SyncML server",
		fingerprints: &[],
		properties: &[
			("", "syncURL", "http://sync.example.com/sync"),
			("source/addressbook", "sync", "two-way"),
			("source/addressbook", "type", "addressbook:text/vcard:3.0"),
			("source/addressbook", "uri", "card"),
			("source/calendar", "sync", "two-way"),
			("source/calendar", "type", "calendar:text/calendar:2.0"),
			("source/calendar", "uri", "cal"),
			("source/todo", "sync", "two-way"),
			("source/todo", "type", "todo:text/calendar:2.0"),
			("source/todo", "uri", "task"),
			("source/memo", "sync", "two-way"),
			("source/memo", "type", "memo:text/plain:1.0"),
			("source/memo", "uri", "note"),
		],
	},
	Template {
		name: "ScheduleWorld",
		description: "ScheduleWorld server",
		fingerprints: &["scheduleworld"],
		properties: &[
			("", "syncURL", "http://sync.scheduleworld.com/funambol/ds"),
			("", "WebURL", "http://www.scheduleworld.com"),
			("", "ConsumerReady", "1"),
			("source/addressbook", "sync", "two-way"),
			("source/addressbook", "type", "addressbook:text/vcard:3.0"),
			("source/addressbook", "uri", "card3"),
			("source/calendar", "sync", "two-way"),
			("source/calendar", "type", "calendar:text/calendar:2.0"),
			("source/calendar", "uri", "cal2"),
			("source/todo", "sync", "two-way"),
			("source/todo", "type", "todo:text/calendar:2.0"),
			("source/todo", "uri", "task2"),
			("source/memo", "sync", "two-way"),
			("source/memo", "type", "memo:text/plain:1.0"),
			("source/memo", "uri", "note"),
		],
	},
	Template {
		name: "Funambol",
		description: "Funambol server",
		fingerprints: &["funambol"],
		properties: &[
			("", "syncURL", "http://my.funambol.com/sync"),
			("", "WebURL", "http://my.funambol.com"),
			("", "ConsumerReady", "1"),
			("source/addressbook", "sync", "two-way"),
			("source/addressbook", "type", "addressbook:text/x-vcard:2.1"),
			("source/addressbook", "uri", "card"),
			("source/calendar", "sync", "two-way"),
			("source/calendar", "type", "calendar:text/calendar:2.0"),
			("source/calendar", "uri", "event"),
			("source/todo", "sync", "two-way"),
			("source/todo", "type", "todo:text/calendar:2.0"),
			("source/todo", "uri", "task"),
		],
	},
	Template {
		name: "Memotoo",
		description: "Memotoo server",
		fingerprints: &["memotoo"],
		properties: &[
			("", "syncURL", "http://sync.memotoo.com/syncML"),
			("", "WebURL", "http://www.memotoo.com"),
			("source/addressbook", "sync", "two-way"),
			("source/addressbook", "type", "addressbook:text/x-vcard:2.1"),
			("source/addressbook", "uri", "con"),
		],
	},
];

pub fn list_templates() -> Vec<&'static Template> {
	TEMPLATES.iter().collect()
}

pub fn find_template(name: &str) -> Option<&'static Template> {
	TEMPLATES.iter().find(|t| t.name.eq_ignore_ascii_case(name))
}

/// Best template for a device fingerprint, with its score
pub fn match_fingerprint(fingerprint: &str) -> Option<(&'static Template, u32)> {
	TEMPLATES
		.iter()
		.map(|t| (t, t.score(fingerprint)))
		.filter(|(_, score)| *score > 0)
		.max_by_key(|(_, score)| *score)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_find_by_name_case_insensitive() {
		assert!(find_template("funambol").is_some());
		assert!(find_template("FUNAMBOL").is_some());
		assert!(find_template("no-such-peer").is_none());
	}

	#[test]
	fn test_template_map_carries_metadata() {
		let map = find_template("ScheduleWorld").unwrap().to_map();
		assert_eq!(map[""]["templateName"], "ScheduleWorld");
		assert_eq!(map[""]["syncURL"], "http://sync.scheduleworld.com/funambol/ds");
		assert_eq!(map["source/addressbook"]["uri"], "card3");
	}

	#[test]
	fn test_fingerprint_matching() {
		let (t, score) = match_fingerprint("Memotoo SyncML").unwrap();
		assert_eq!(t.name, "Memotoo");
		assert!(score >= 3);
		assert!(match_fingerprint("Unknown Phone 3000").is_none());
	}
}

// vim: ts=4
