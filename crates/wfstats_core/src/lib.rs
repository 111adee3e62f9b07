//! Statistics over Wikifunctions dumps: functions, their implementations and
//! testers, and the live test status of every implementation/tester pair.

pub mod aggregate;
pub mod client;
pub mod config;
pub mod download;
pub mod dump;
pub mod entity;
pub mod entity_map;
pub mod pipeline;
pub mod resolver;
pub mod wikitext;
