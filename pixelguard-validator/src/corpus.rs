//! Reference corpus for the performance and false-positive stages.
//!
//! Two domain lists drive everything: known-legitimate domains (what must not
//! match) and known trackers (what should). The URL sets the stages run against
//! are derived from them once, at construction.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, info};

use crate::ValidatorError;

pub const LEGITIMATE_FILE: &str = "legitimate_domains.txt";
pub const TRACKERS_FILE: &str = "known_trackers.txt";

const PERFORMANCE_URL_CAP: usize = 1000;
const LEGITIMATE_URL_CAP: usize = 500;
const TRACKER_URL_CAP: usize = 100;

const DEFAULT_LEGITIMATE: &[&str] = &[
    "gmail.com", "outlook.com", "yahoo.com", "hotmail.com", "icloud.com", "protonmail.com",
    "aol.com", "google.com", "microsoft.com", "apple.com", "amazon.com", "facebook.com",
    "twitter.com", "linkedin.com", "instagram.com", "ebay.com", "paypal.com", "stripe.com",
    "shopify.com", "etsy.com", "walmart.com", "target.com", "cnn.com", "bbc.com",
    "reuters.com", "nytimes.com", "theguardian.com", "wsj.com", "bloomberg.com", "chase.com",
    "bankofamerica.com", "wellsfargo.com", "citibank.com", "schwab.com", "fidelity.com",
    "github.com", "stackoverflow.com", "mozilla.org", "cloudflare.com", "salesforce.com",
    "irs.gov", "treasury.gov", "fbi.gov", "nasa.gov", "whitehouse.gov", "congress.gov",
];

const DEFAULT_TRACKERS: &[&str] = &[
    "googletagmanager.com", "google-analytics.com", "doubleclick.net", "connect.facebook.net",
    "analytics.twitter.com", "scorecardresearch.com", "quantserve.com", "outbrain.com",
    "taboola.com", "adsystem.com", "advertising.com", "adsrvr.org", "bluekai.com", "krxd.net",
    "rlcdn.com", "rubiconproject.com", "amazon-adsystem.com",
];

#[derive(Debug, Clone)]
pub struct Corpus {
    legitimate: BTreeSet<String>,
    trackers: BTreeSet<String>,
    performance_urls: Vec<String>,
    legitimate_urls: Vec<String>,
    tracker_urls: Vec<String>,
}

impl Corpus {
    pub fn new<L, T>(legitimate: L, trackers: T) -> Self
    where
        L: IntoIterator,
        L::Item: Into<String>,
        T: IntoIterator,
        T::Item: Into<String>,
    {
        let legitimate = normalize(legitimate);
        let trackers = normalize(trackers);

        let mut performance_urls = Vec::new();
        for domain in legitimate.iter().take(100) {
            performance_urls.extend([
                format!("https://{domain}/"),
                format!("https://{domain}/index.html"),
                format!("https://{domain}/page.php?id=123"),
                format!("https://www.{domain}/contact"),
                format!("https://subdomain.{domain}/api/v1/data"),
            ]);
        }
        for domain in trackers.iter().take(50) {
            performance_urls.extend([
                format!("https://{domain}/track?pixel=1x1"),
                format!("https://{domain}/collect.gif"),
                format!("https://{domain}/beacon.js"),
                format!("https://{domain}/analytics.png?user=123"),
                format!("https://{domain}/pixel.gif?email=open"),
            ]);
        }
        performance_urls.truncate(PERFORMANCE_URL_CAP);

        let mut legitimate_urls: Vec<String> = legitimate
            .iter()
            .flat_map(|domain| {
                [
                    format!("https://{domain}/"),
                    format!("https://www.{domain}/index.html"),
                    format!("https://{domain}/contact.php"),
                    format!("https://mail.{domain}/inbox"),
                ]
            })
            .collect();
        legitimate_urls.truncate(LEGITIMATE_URL_CAP);

        let mut tracker_urls: Vec<String> = trackers
            .iter()
            .flat_map(|domain| {
                [
                    format!("https://{domain}/track.gif"),
                    format!("https://{domain}/pixel.png"),
                    format!("https://{domain}/collect.js"),
                ]
            })
            .collect();
        tracker_urls.truncate(TRACKER_URL_CAP);

        Self {
            legitimate,
            trackers,
            performance_urls,
            legitimate_urls,
            tracker_urls,
        }
    }

    /// Corpus built from the lists the pipeline ships with.
    pub fn builtin() -> Self {
        Self::new(
            DEFAULT_LEGITIMATE.iter().copied(),
            DEFAULT_TRACKERS.iter().copied(),
        )
    }

    /// Loads the two list files from `dir`. A missing file falls back to the built-in list.
    pub fn load(dir: &Path) -> Result<Self, ValidatorError> {
        if !dir.is_dir() {
            return Err(ValidatorError::Corpus(format!(
                "corpus directory {} does not exist",
                dir.display()
            )));
        }
        let legitimate = read_list(&dir.join(LEGITIMATE_FILE))?
            .unwrap_or_else(|| DEFAULT_LEGITIMATE.iter().map(|s| s.to_string()).collect());
        let trackers = read_list(&dir.join(TRACKERS_FILE))?
            .unwrap_or_else(|| DEFAULT_TRACKERS.iter().map(|s| s.to_string()).collect());

        let corpus = Self::new(legitimate, trackers);
        if corpus.legitimate_urls.is_empty() {
            return Err(ValidatorError::Corpus(
                "legitimate domain list is empty".to_string(),
            ));
        }
        info!(
            legitimate = corpus.legitimate.len(),
            trackers = corpus.trackers.len(),
            dir = %dir.display(),
            "Validation corpus loaded"
        );
        Ok(corpus)
    }

    pub fn is_legitimate(&self, domain: &str) -> bool {
        self.legitimate.contains(domain)
    }

    pub fn is_tracker(&self, domain: &str) -> bool {
        self.trackers.contains(domain)
    }

    pub fn performance_urls(&self) -> &[String] {
        &self.performance_urls
    }

    pub fn legitimate_urls(&self) -> &[String] {
        &self.legitimate_urls
    }

    pub fn tracker_urls(&self) -> &[String] {
        &self.tracker_urls
    }
}

impl Default for Corpus {
    fn default() -> Self {
        Self::builtin()
    }
}

fn normalize<I>(domains: I) -> BTreeSet<String>
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    domains
        .into_iter()
        .map(|d| d.into().trim().to_ascii_lowercase())
        .filter(|d| !d.is_empty() && !d.starts_with('#'))
        .collect()
}

fn read_list(path: &Path) -> Result<Option<Vec<String>>, ValidatorError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content.lines().map(str::to_string).collect())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "Corpus list missing, using built-in list");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}
