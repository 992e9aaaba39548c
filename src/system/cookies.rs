// src/system/cookies.rs

use crate::constants::MAX_COOKIE_EXPIRY_DAYS;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CookieError {
    #[error("Filesystem Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to decode cookie jar from binary format: {0}")]
    BincodeDecode(#[from] bincode::error::DecodeError),
    #[error("Failed to encode cookie jar to binary format: {0}")]
    BincodeEncode(#[from] bincode::error::EncodeError),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SameSite {
    #[default]
    Strict,
    Lax,
    None,
}

/// A single cookie as written by the memory store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub expires: SystemTime,
    pub same_site: SameSite,
    pub secure: bool,
}

impl Cookie {
    /// Creates a `SameSite=Strict` cookie expiring `max_age` from now. A lifetime past what
    /// `SystemTime` can represent is clamped to [`MAX_LIFETIME`].
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        max_age: Duration,
        secure: bool,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            expires: expires_after(max_age),
            same_site: SameSite::Strict,
            secure,
        }
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expires <= now
    }

    /// Renders the cookie as a `document.cookie` / `Set-Cookie` assignment.
    pub fn to_header(&self) -> String {
        let max_age = self
            .expires
            .duration_since(SystemTime::now())
            .unwrap_or_default()
            .as_secs();
        let same_site = match self.same_site {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        };
        let mut header = format!(
            "{}={}; Max-Age={}; Path=/; SameSite={}",
            self.name, self.value, max_age, same_site
        );
        if self.secure {
            header.push_str("; Secure");
        }
        header
    }
}

/// Upper bound on cookie lifetime.
pub const MAX_LIFETIME: Duration = Duration::from_secs(MAX_COOKIE_EXPIRY_DAYS * 24 * 60 * 60);

fn expires_after(max_age: Duration) -> SystemTime {
    let now = SystemTime::now();
    now.checked_add(max_age.min(MAX_LIFETIME)).unwrap_or(now)
}

/// Where persisted memory lives. In a browser this is `document.cookie`.
pub trait CookieJar: Send {
    /// Value of a live (not expired) cookie.
    fn get(&self, name: &str) -> Option<String>;
    fn set(&mut self, cookie: Cookie) -> Result<(), CookieError>;
    fn remove(&mut self, name: &str) -> Result<(), CookieError>;
    /// Names of all live cookies.
    fn names(&self) -> Vec<String>;
}

fn live_value(cookies: &BTreeMap<String, Cookie>, name: &str) -> Option<String> {
    let now = SystemTime::now();
    cookies
        .get(name)
        .filter(|c| !c.is_expired(now))
        .map(|c| c.value.clone())
}

fn live_names(cookies: &BTreeMap<String, Cookie>) -> Vec<String> {
    let now = SystemTime::now();
    cookies
        .values()
        .filter(|c| !c.is_expired(now))
        .map(|c| c.name.clone())
        .collect()
}

// --- IN-MEMORY JAR ---

/// In-memory jar. Clones share the same cookies, which is how a page reload is simulated:
/// a fresh store built over a clone of the old jar sees what the old store wrote.
#[derive(Debug, Clone, Default)]
pub struct MemoryCookieJar {
    cookies: Arc<Mutex<BTreeMap<String, Cookie>>>,
}

impl MemoryCookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full cookie record, expired or not.
    pub fn cookie(&self, name: &str) -> Option<Cookie> {
        self.cookies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Writes a raw value, bypassing the memory store's encoding.
    pub fn insert_raw(&self, name: &str, value: &str) {
        let cookie = Cookie::new(name, value, Duration::from_secs(3600), false);
        self.cookies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), cookie);
    }
}

impl CookieJar for MemoryCookieJar {
    fn get(&self, name: &str) -> Option<String> {
        live_value(
            &self.cookies.lock().unwrap_or_else(PoisonError::into_inner),
            name,
        )
    }

    fn set(&mut self, cookie: Cookie) -> Result<(), CookieError> {
        self.cookies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cookie.name.clone(), cookie);
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<(), CookieError> {
        self.cookies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        Ok(())
    }

    fn names(&self) -> Vec<String> {
        live_names(&self.cookies.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

// --- FILE-BACKED JAR ---

/// A jar persisted to a binary file, rewritten after every mutation.
#[derive(Debug)]
pub struct FileCookieJar {
    path: PathBuf,
    cookies: BTreeMap<String, Cookie>,
}

impl FileCookieJar {
    /// Opens the jar at `path`, starting empty when the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CookieError> {
        let path = path.into();
        let cookies = if path.exists() {
            let bytes = fs::read(&path)?;
            let (cookies, _): (BTreeMap<String, Cookie>, usize) =
                bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
            cookies
        } else {
            BTreeMap::new()
        };
        log::debug!(
            "Opened cookie jar '{}' with {} cookie(s).",
            path.display(),
            cookies.len()
        );
        Ok(Self { path, cookies })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drops every cookie and persists the empty jar.
    pub fn clear(&mut self) -> Result<(), CookieError> {
        self.cookies.clear();
        self.save()
    }

    fn save(&self) -> Result<(), CookieError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let now = SystemTime::now();
        let live: BTreeMap<&String, &Cookie> = self
            .cookies
            .iter()
            .filter(|(_, c)| !c.is_expired(now))
            .collect();
        let bytes = bincode::serde::encode_to_vec(&live, bincode::config::standard())?;
        fs::write(&self.path, bytes)?;
        Ok(())
    }
}

impl CookieJar for FileCookieJar {
    fn get(&self, name: &str) -> Option<String> {
        live_value(&self.cookies, name)
    }

    fn set(&mut self, cookie: Cookie) -> Result<(), CookieError> {
        self.cookies.insert(cookie.name.clone(), cookie);
        self.save()
    }

    fn remove(&mut self, name: &str) -> Result<(), CookieError> {
        if self.cookies.remove(name).is_some() {
            self.save()?;
        }
        Ok(())
    }

    fn names(&self) -> Vec<String> {
        live_names(&self.cookies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_jar_clones_share_cookies() {
        let mut jar = MemoryCookieJar::new();
        let reloaded = jar.clone();

        jar.set(Cookie::new("OT_a", "1", Duration::from_secs(60), false))
            .unwrap();

        assert_eq!(reloaded.get("OT_a"), Some("1".to_string()));
        assert_eq!(reloaded.names(), vec!["OT_a".to_string()]);
    }

    #[test]
    fn test_huge_lifetime_is_clamped() {
        let cookie = Cookie::new("OT_a", "1", Duration::MAX, false);
        let lifetime = cookie.expires.duration_since(SystemTime::now()).unwrap();
        assert!(lifetime <= MAX_LIFETIME);
        assert!(lifetime > MAX_LIFETIME - Duration::from_secs(60));
    }

    #[test]
    fn test_expired_cookies_are_invisible() {
        let mut jar = MemoryCookieJar::new();
        let mut cookie = Cookie::new("old", "x", Duration::from_secs(60), false);
        cookie.expires = SystemTime::now() - Duration::from_secs(1);
        jar.set(cookie).unwrap();

        assert_eq!(jar.get("old"), None);
        assert!(jar.names().is_empty());
        assert!(jar.cookie("old").is_some());
    }

    #[test]
    fn test_cookie_header_flags() {
        let cookie = Cookie::new("OT_INDEX", "W10=", Duration::from_secs(600), true);
        let header = cookie.to_header();
        assert!(header.starts_with("OT_INDEX=W10=; Max-Age="));
        assert!(header.contains("SameSite=Strict"));
        assert!(header.ends_with("; Secure"));
    }

    #[test]
    fn test_file_jar_persists_between_opens() {
        // --- Setup ---
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("cookies.bin");

        // --- Execute ---
        {
            let mut jar = FileCookieJar::open(&path).unwrap();
            jar.set(Cookie::new("OT_theme", "dark", Duration::from_secs(60), false))
                .unwrap();
            jar.set(Cookie::new("OT_gone", "x", Duration::from_secs(60), false))
                .unwrap();
            jar.remove("OT_gone").unwrap();
        }
        let jar = FileCookieJar::open(&path).unwrap();

        // --- Assert ---
        assert_eq!(jar.get("OT_theme"), Some("dark".to_string()));
        assert_eq!(jar.get("OT_gone"), None);
    }

    #[test]
    fn test_file_jar_rejects_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cookies.bin");
        fs::write(&path, [0xff, 0xff, 0xff]).unwrap();

        assert!(FileCookieJar::open(&path).is_err());
    }
}
