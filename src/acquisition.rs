//! Portal search: login, paginated result fetching and card parsing.

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::VecDeque;
use std::sync::LazyLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{AcquisitionError, PageError, PipelineError, Result};
use crate::models::{CandidateRecord, SearchQuery};
use crate::secret::Credentials;
use crate::transport::{OutboundRequest, RateLimitedTransport};

const SCOPE: &str = "portal";
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

static FIRST_NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?").expect("valid regex"));

/// CSS selectors for the generic result-card markup.
#[derive(Debug, Clone)]
pub struct ResultSelectors {
    pub container: String,
    pub card: String,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub experience: String,
    pub company: String,
    pub designation: String,
    pub skills: String,
    pub location: String,
    pub profile_link: String,
    pub salary: String,
    pub posted_date: String,
    /// Card attribute holding the portal's own id.
    pub id_attribute: String,
}

impl Default for ResultSelectors {
    fn default() -> Self {
        Self {
            container: ".search-results".into(),
            card: ".candidate-card".into(),
            name: ".name".into(),
            email: ".email".into(),
            phone: ".phone".into(),
            experience: ".experience".into(),
            company: ".company".into(),
            designation: ".designation".into(),
            skills: ".skills li".into(),
            location: ".location".into(),
            profile_link: "a.profile".into(),
            salary: ".salary".into(),
            posted_date: ".posted".into(),
            id_attribute: "data-id".into(),
        }
    }
}

struct CompiledSelectors {
    container: Selector,
    card: Selector,
    name: Selector,
    email: Selector,
    phone: Selector,
    experience: Selector,
    company: Selector,
    designation: Selector,
    skills: Selector,
    location: Selector,
    profile_link: Selector,
    salary: Selector,
    posted_date: Selector,
    id_attribute: String,
}

impl CompiledSelectors {
    fn compile(raw: &ResultSelectors) -> Result<Self> {
        Ok(Self {
            container: selector(&raw.container)?,
            card: selector(&raw.card)?,
            name: selector(&raw.name)?,
            email: selector(&raw.email)?,
            phone: selector(&raw.phone)?,
            experience: selector(&raw.experience)?,
            company: selector(&raw.company)?,
            designation: selector(&raw.designation)?,
            skills: selector(&raw.skills)?,
            location: selector(&raw.location)?,
            profile_link: selector(&raw.profile_link)?,
            salary: selector(&raw.salary)?,
            posted_date: selector(&raw.posted_date)?,
            id_attribute: raw.id_attribute.clone(),
        })
    }
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| PipelineError::Validation(format!("invalid selector `{}`: {:?}", css, e)))
}

#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub base_url: String,
    pub search_path: String,
    pub login_path: String,
    pub credentials: Option<Credentials>,
    pub selectors: ResultSelectors,
}

impl PortalConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            search_path: "/search".into(),
            login_path: "/login".into(),
            credentials: None,
            selectors: ResultSelectors::default(),
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SearchLimits {
    pub max_pages: u32,
    pub max_results: usize,
}

impl Default for SearchLimits {
    fn default() -> Self {
        Self {
            max_pages: 5,
            max_results: 100,
        }
    }
}

/// Client-side filter applied to parsed records.
///
/// Records whose experience is unknown pass the experience bounds. Location
/// and company lists match case-insensitive substrings.
#[derive(Debug, Clone, Default)]
pub struct CandidateFilter {
    pub experience_min: Option<f64>,
    pub experience_max: Option<f64>,
    pub locations: Vec<String>,
    pub companies: Vec<String>,
}

impl CandidateFilter {
    pub fn from_query(query: &SearchQuery) -> Self {
        Self {
            experience_min: query.experience_min,
            experience_max: query.experience_max,
            ..Default::default()
        }
    }

    pub fn with_locations(mut self, locations: Vec<String>) -> Self {
        self.locations = locations;
        self
    }

    pub fn with_companies(mut self, companies: Vec<String>) -> Self {
        self.companies = companies;
        self
    }

    pub fn matches(&self, record: &CandidateRecord) -> bool {
        if let Some(years) = record.experience_years {
            if self.experience_min.is_some_and(|min| years < min) {
                return false;
            }
            if self.experience_max.is_some_and(|max| years > max) {
                return false;
            }
        }
        contains_any(record.location.as_deref(), &self.locations)
            && contains_any(record.current_company.as_deref(), &self.companies)
    }
}

fn contains_any(value: Option<&str>, needles: &[String]) -> bool {
    if needles.is_empty() {
        return true;
    }
    let value = value.unwrap_or_default().to_lowercase();
    needles.iter().any(|n| value.contains(&n.to_lowercase()))
}

/// Records parsed from one page, after filtering and truncation.
#[derive(Debug, Clone)]
pub struct PageBatch {
    pub page: u32,
    pub records: Vec<CandidateRecord>,
    pub skipped: usize,
    pub filtered: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchStats {
    pub pages_fetched: u32,
    pub records_produced: usize,
    pub skipped: usize,
    pub filtered: usize,
    pub failures: u32,
}

struct ParsedPage {
    cards: usize,
    records: Vec<CandidateRecord>,
    skipped: usize,
}

pub struct Acquisition {
    transport: RateLimitedTransport,
    base: Url,
    config: PortalConfig,
    selectors: CompiledSelectors,
}

impl Acquisition {
    pub fn new(config: PortalConfig, transport: RateLimitedTransport) -> Result<Self> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| PipelineError::Validation(format!("invalid portal URL: {}", e)))?;
        let selectors = CompiledSelectors::compile(&config.selectors)?;
        Ok(Self {
            transport,
            base,
            config,
            selectors,
        })
    }

    /// Log in with the configured credentials. One attempt; any failure is fatal.
    pub fn authenticate(&self) -> Result<()> {
        let Some(credentials) = &self.config.credentials else {
            return Ok(());
        };
        let url = self
            .base
            .join(&self.config.login_path)
            .map_err(|e| PipelineError::Validation(format!("invalid login path: {}", e)))?;
        let form = vec![
            ("username".to_string(), credentials.username.clone()),
            ("password".to_string(), credentials.password.expose().to_string()),
        ];

        match self.transport.send_once(SCOPE, &OutboundRequest::post_form(url.as_str(), form)) {
            Ok(_) => {
                info!("portal login succeeded");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err.cause, "portal login failed");
                Err(PipelineError::Authentication(format!("login request failed: {}", err.cause)))
            }
        }
    }

    /// Page URL with only the present query parameters.
    pub fn page_url(&self, query: &SearchQuery, page: u32) -> Result<Url> {
        let mut url = self
            .base
            .join(&self.config.search_path)
            .map_err(|e| PipelineError::Validation(format!("invalid search path: {}", e)))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("keyword", &query.keyword);
            pairs.append_pair("location", &query.location);
            if let Some(min) = query.experience_min {
                pairs.append_pair("exp_min", &min.to_string());
            }
            if let Some(max) = query.experience_max {
                pairs.append_pair("exp_max", &max.to_string());
            }
            if let Some(job_type) = &query.job_type {
                pairs.append_pair("job_type", job_type);
            }
            pairs.append_pair("page", &page.to_string());
        }
        Ok(url)
    }

    /// Start a lazy search from the query's cursor. Logs in first when
    /// credentials are configured.
    pub fn search(&self, query: &SearchQuery, limits: SearchLimits, filter: CandidateFilter) -> Result<SearchStream<'_>> {
        self.authenticate()?;
        info!(
            search_id = query.id,
            keyword = %query.keyword,
            max_pages = limits.max_pages,
            max_results = limits.max_results,
            "starting search"
        );
        Ok(SearchStream {
            acquisition: self,
            query: query.clone(),
            limits,
            filter,
            cursor: query.next_page.max(1),
            pages_attempted: 0,
            consecutive_failures: 0,
            done: false,
            buffer: VecDeque::new(),
            stats: SearchStats::default(),
        })
    }

    fn fetch_page(&self, query: &SearchQuery, page: u32) -> std::result::Result<ParsedPage, PageError> {
        let url = self.page_url(query, page).map_err(|e| PageError::Parse {
            page,
            reason: e.to_string(),
        })?;
        let response = self.transport.send(SCOPE, &OutboundRequest::get(url.as_str()))?;
        self.parse_page(&response.body, page)
    }

    fn parse_page(&self, html: &str, page: u32) -> std::result::Result<ParsedPage, PageError> {
        let document = Html::parse_document(html);
        let Some(container) = document.select(&self.selectors.container).next() else {
            return Err(PageError::Parse {
                page,
                reason: "results container not found".into(),
            });
        };

        let mut parsed = ParsedPage {
            cards: 0,
            records: Vec::new(),
            skipped: 0,
        };
        for card in container.select(&self.selectors.card) {
            parsed.cards += 1;
            match self.parse_card(card) {
                Some(record) => parsed.records.push(record),
                None => {
                    parsed.skipped += 1;
                    warn!(page, card = parsed.cards, "skipping card without a name");
                }
            }
        }
        Ok(parsed)
    }

    fn parse_card(&self, card: ElementRef<'_>) -> Option<CandidateRecord> {
        let s = &self.selectors;
        let name = field(card, &s.name)?;

        let skills = card
            .select(&s.skills)
            .map(|el| collapse(&el.text().collect::<String>()))
            .filter(|skill| !skill.is_empty())
            .collect();

        let profile_url = card
            .select(&s.profile_link)
            .next()
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| self.base.join(href.trim()).ok())
            .map(String::from);

        Some(CandidateRecord {
            source_id: card
                .value()
                .attr(&s.id_attribute)
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(String::from),
            name,
            email: field(card, &s.email),
            phone: field(card, &s.phone),
            experience_years: field(card, &s.experience).and_then(|text| parse_experience(&text)),
            current_company: field(card, &s.company),
            current_designation: field(card, &s.designation),
            skills,
            location: field(card, &s.location),
            profile_url,
            salary: field(card, &s.salary),
            posted_date: field(card, &s.posted_date),
        })
    }
}

/// Trimmed text of the first match, `None` for absent or placeholder values.
fn field(card: ElementRef<'_>, selector: &Selector) -> Option<String> {
    let text = collapse(&card.select(selector).next()?.text().collect::<String>());
    if text.is_empty() || is_placeholder(&text) {
        None
    } else {
        Some(text)
    }
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_placeholder(text: &str) -> bool {
    matches!(text.to_lowercase().as_str(), "n/a" | "na" | "-" | "not disclosed")
}

/// First number in free text: `"3.5 Yrs"` → 3.5, `"2-4 years"` → 2.
pub fn parse_experience(text: &str) -> Option<f64> {
    FIRST_NUMBER
        .find(text)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|years| years.is_finite())
}

/// Lazy page-by-page search results.
///
/// Stops at `max_pages` pages attempted, `max_results` records produced, an
/// empty page, or three consecutive page failures. A failed page is not
/// re-fetched.
pub struct SearchStream<'a> {
    acquisition: &'a Acquisition,
    query: SearchQuery,
    limits: SearchLimits,
    filter: CandidateFilter,
    cursor: u32,
    pages_attempted: u32,
    consecutive_failures: u32,
    done: bool,
    buffer: VecDeque<CandidateRecord>,
    stats: SearchStats,
}

impl SearchStream<'_> {
    pub fn stats(&self) -> SearchStats {
        self.stats
    }

    /// Next page number that would be fetched.
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    pub fn next_page(&mut self) -> Option<std::result::Result<PageBatch, AcquisitionError>> {
        loop {
            if self.done
                || self.pages_attempted >= self.limits.max_pages
                || self.stats.records_produced >= self.limits.max_results
            {
                self.done = true;
                return None;
            }

            let page = self.cursor;
            self.cursor += 1;
            self.pages_attempted += 1;

            let parsed = match self.acquisition.fetch_page(&self.query, page) {
                Ok(parsed) => parsed,
                Err(err) => {
                    self.consecutive_failures += 1;
                    self.stats.failures += 1;
                    warn!(
                        search_id = self.query.id,
                        page,
                        failures = self.consecutive_failures,
                        error = %err,
                        "page failed"
                    );
                    if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        self.done = true;
                        return Some(Err(AcquisitionError {
                            pages_completed: self.stats.pages_fetched,
                            last_error: err,
                        }));
                    }
                    continue;
                }
            };

            self.consecutive_failures = 0;
            self.stats.pages_fetched += 1;
            self.stats.skipped += parsed.skipped;

            if parsed.cards == 0 {
                debug!(search_id = self.query.id, page, "empty page, search exhausted");
                self.done = true;
                return None;
            }

            let before = parsed.records.len();
            let mut records: Vec<CandidateRecord> = parsed
                .records
                .into_iter()
                .filter(|record| self.filter.matches(record))
                .collect();
            let filtered = before - records.len();
            self.stats.filtered += filtered;

            let remaining = self.limits.max_results - self.stats.records_produced;
            records.truncate(remaining);
            self.stats.records_produced += records.len();

            info!(
                search_id = self.query.id,
                page,
                records = records.len(),
                skipped = parsed.skipped,
                filtered,
                "page fetched"
            );
            return Some(Ok(PageBatch {
                page,
                records,
                skipped: parsed.skipped,
                filtered,
            }));
        }
    }
}

impl Iterator for SearchStream<'_> {
    type Item = std::result::Result<CandidateRecord, AcquisitionError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Some(Ok(record));
            }
            match self.next_page()? {
                Ok(batch) => self.buffer.extend(batch.records),
                Err(err) => return Some(Err(err)),
            }
        }
    }
}
