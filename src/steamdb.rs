//! Build and depot facts scraped from a SteamDB app history page.
//!
//! The page layout is not under our control, so extraction is tolerant:
//! anything that does not match is "not found yet" and the fetch loop polls
//! again.

use crate::{
    error::FetchError,
    fetcher::{DepotRow, FactSession, FactSource, Observation},
};
use regex::Regex;
use std::{sync::OnceLock, time::Duration};

pub const DEFAULT_BASE_URL: &str = "https://steamdb.info";
const USER_AGENT: &str = concat!("sgub/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct SteamDbSource {
    base_url: String,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl SteamDbSource {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(15),
        }
    }

    pub fn history_url(&self, app_id: &str) -> String {
        format!("{}/app/{}/history/", self.base_url, app_id.trim())
    }
}

impl Default for SteamDbSource {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

/// HTTP agent bound to one app's history page. Dropped with the fetch.
pub struct SteamDbSession {
    agent: ureq::Agent,
    url: String,
}

impl FactSource for SteamDbSource {
    type Session = SteamDbSession;

    fn open(&self, app_id: &str) -> Result<SteamDbSession, FetchError> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(self.connect_timeout)
            .timeout_read(self.read_timeout)
            .timeout_write(self.read_timeout)
            .build();
        Ok(SteamDbSession {
            agent,
            url: self.history_url(app_id),
        })
    }
}

impl FactSession for SteamDbSession {
    fn poll(&mut self) -> Result<Observation, FetchError> {
        let response = match self
            .agent
            .get(&self.url)
            .set("User-Agent", USER_AGENT)
            .set("Accept", "text/html")
            .call()
        {
            Ok(response) => response,
            Err(ureq::Error::Status(status, _)) => {
                return Err(FetchError::Status {
                    url: self.url.clone(),
                    status,
                })
            }
            Err(err) => {
                return Err(FetchError::Transport {
                    url: self.url.clone(),
                    message: err.to_string(),
                })
            }
        };
        let body = response.into_string().map_err(|source| FetchError::Body {
            url: self.url.clone(),
            source,
        })?;
        Ok(parse_history(&body))
    }
}

/// Extracts what the page currently shows. Entries are newest first, so the
/// first build id and the first value per depot field are the latest.
pub fn parse_history(html: &str) -> Observation {
    let mut observation = Observation::default();

    for item in list_item_re().captures_iter(html) {
        let inner = &item[1];
        let text = visible_text(inner);

        if is_public_build_line(&text) {
            if observation.build_id.is_none() {
                observation.build_id = inserted_value(inner).and_then(|value| digits(&value));
            }
            continue;
        }

        if !text.contains("Depot ") {
            continue;
        }
        let Some(depot) = depot_link_re().captures(inner) else {
            continue;
        };
        observation.depots.push(DepotRow {
            depot_id: depot[1].to_string(),
            platform: platform_re()
                .captures(&text)
                .map(|caps| caps[1].trim().to_string()),
            manifest: class_ins_re()
                .captures(inner)
                .and_then(|caps| digits(&caps[1])),
            size: ins_tag_re()
                .captures(inner)
                .and_then(|caps| digits(&caps[1]))
                .and_then(|value| value.parse().ok()),
        });
    }

    observation
}

fn is_public_build_line(text: &str) -> bool {
    let lower = text.to_lowercase();
    if !lower.contains("buildid") {
        return false;
    }
    !lower.contains("branches/") || lower.contains("branches/public/")
}

fn inserted_value(html: &str) -> Option<String> {
    class_ins_re()
        .captures(html)
        .or_else(|| ins_tag_re().captures(html))
        .map(|caps| caps[1].to_string())
}

fn digits(value: &str) -> Option<String> {
    let cleaned: String = value
        .chars()
        .filter(|ch| !ch.is_whitespace() && *ch != ',')
        .collect();
    if cleaned.is_empty() || !cleaned.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    Some(cleaned)
}

fn visible_text(html: &str) -> String {
    let stripped = tag_re().replace_all(html, " ");
    let decoded = stripped
        .replace("&nbsp;", " ")
        .replace("&#160;", " ")
        .replace("&amp;", "&");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn list_item_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<li\b[^>]*>(.*?)</li>").expect("valid regex"))
}

fn depot_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<a\b[^>]*\bclass="[^"]*\bhistory-link\b[^"]*"[^>]*>\s*(\d+)\s*</a>"#)
            .expect("valid regex")
    })
}

fn class_ins_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"<[a-z][a-z0-9]*\b[^>]*\bclass="(?:[^"]*\s)?ins(?:\s[^"]*)?"[^>]*>([^<]*)<"#)
            .expect("valid regex")
    })
}

fn ins_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<ins\b[^>]*>([^<]*)</ins>").expect("valid regex"))
}

fn platform_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([^\]]+)\]").expect("valid regex"))
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]*>").expect("valid regex"))
}
