//! Deadlock-resilient normalized bulk loader
//!
//! Peer workers write the same dictionary tables concurrently, so the load is
//! phased to keep lock windows short and lock order fixed:
//!
//! 1. Dictionary preload — outside the main transaction, one short
//!    transaction per dictionary table in the fixed [`PRELOAD_ORDER`]
//!    (`region` is always the first table contacted), insert-ignore for new
//!    names followed by an id reload into the worker-local cache. Deadlocked
//!    preloads retry up to 3 times with quadratic backoff.
//! 2. Main transaction — foreign-key checks off, batch insert of geo triples
//!    (resolved back through a Memory-engine probe table joined with `<=>`),
//!    companies, and the three link tables, all chunked insert-ignore.
//! 3. Whole-batch retry — a jittered stagger precedes every attempt; a
//!    deadlock anywhere rolls back and re-runs the insert up to 5 times.
//!
//! All writes are idempotent, so a batch that retries or is redelivered by
//! the broker converges to the same row set.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use rand::Rng;
use sqlx::{MySql, MySqlPool, Transaction};
use tracing::warn;

use crate::cache::{self, Dictionary, DictionaryCache, PRELOAD_ORDER};
use crate::retry::{backoff_delay, error_chain, is_deadlock};
use crate::types::{CompanyRecord, Summary};

/// Attempts for the whole batch when it keeps deadlocking.
const MAX_INSERT_ATTEMPTS: u32 = 5;
/// Attempts for one dictionary preload transaction.
const MAX_DICTIONARY_ATTEMPTS: u32 = 3;
/// Pairs per INSERT into the link tables.
const LINK_CHUNK: usize = 5_000;
/// Names per IN-list when reloading dictionary ids.
const DICTIONARY_CHUNK: usize = 10_000;
/// Triples per INSERT into geo.
const GEO_CHUNK: usize = 10_000;
/// Triples per INSERT into the probe table.
const GEO_PROBE_CHUNK: usize = 5_000;

/// Tail-cleanup thresholds for comma-separated category lists; they match a
/// truncation artifact of the upstream exporter.
const TAIL_CLEANUP_MIN_LEN: usize = 540;
const TAIL_CLEANUP_SHORT_TOKEN: usize = 4;

/// `(region_id, district_id, city_id)` with NULL slots as `None`.
type GeoTriple = (Option<i64>, Option<i64>, Option<i64>);

#[derive(Default)]
struct CategoryLinks {
    category: HashSet<i64>,
    subcategory: HashSet<i64>,
}

/// Mutable loader state behind one lock: counters, link collectors and the
/// diagnostics list. Collectors are sets, so re-collection after a retry is
/// harmless.
#[derive(Default)]
struct LoaderState {
    company_count: usize,
    company_geos: HashMap<i64, HashSet<i64>>,
    company_categories: HashMap<i64, CategoryLinks>,
    errors: Vec<String>,
}

/// Normalized bulk loader owned by one worker.
pub struct BulkLoader {
    pool: MySqlPool,
    cache: DictionaryCache,
    state: RwLock<LoaderState>,
}

impl BulkLoader {
    pub fn new(pool: MySqlPool) -> Self {
        Self {
            pool,
            cache: DictionaryCache::new(),
            state: RwLock::new(LoaderState::default()),
        }
    }

    /// Load one parsed batch. Deadlocks are retried here; any other failure
    /// aborts immediately and is left to the worker's requeue policy.
    pub async fn insert(&self, rows: &[CompanyRecord]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut attempt = 0;
        loop {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
                self.push_error(format!(
                    "retrying import (attempt {}/{})",
                    attempt + 1,
                    MAX_INSERT_ATTEMPTS
                ));
            }

            match self.insert_once(rows).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if !is_deadlock(&error_chain(&err)) {
                        return Err(err);
                    }
                    attempt += 1;
                    if attempt >= MAX_INSERT_ATTEMPTS {
                        return Err(err.context(format!(
                            "import failed after {MAX_INSERT_ATTEMPTS} attempts"
                        )));
                    }
                }
            }
        }
    }

    /// One full attempt: stagger, dictionary preload, main transaction.
    async fn insert_once(&self, rows: &[CompanyRecord]) -> Result<()> {
        // Stagger workers that picked up similar files at the same time.
        let stagger = Duration::from_millis(100 + rand::rng().random_range(0..500));
        tokio::time::sleep(stagger).await;

        self.preload_dictionaries(rows).await?;

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin import transaction")?;

        sqlx::query("SET FOREIGN_KEY_CHECKS = 0")
            .execute(&mut *tx)
            .await
            .context("failed to disable foreign key checks")?;

        self.insert_geo(&mut tx, rows).await?;
        self.insert_companies(&mut tx, rows).await?;

        accumulate_links(&self.cache, &mut self.state.write(), rows);
        self.insert_links(&mut tx).await?;

        // Non-fatal: the session resets the flag when the connection closes.
        if let Err(err) = sqlx::query("SET FOREIGN_KEY_CHECKS = 1").execute(&mut *tx).await {
            warn!("failed to re-enable foreign key checks: {err}");
        }

        tx.commit().await.context("failed to commit import transaction")
    }

    /// Cumulative statistics for this loader.
    pub fn summary(&self) -> Summary {
        build_summary(&self.cache, &self.state.read())
    }

    fn push_error(&self, message: String) {
        self.state.write().errors.push(message);
    }

    // =========================================================================
    // Phase A — dictionary preload
    // =========================================================================

    async fn preload_dictionaries(&self, rows: &[CompanyRecord]) -> Result<()> {
        for (i, dict) in PRELOAD_ORDER.into_iter().enumerate() {
            let names = dictionary_names(dict, rows);
            if names.is_empty() {
                continue;
            }

            // Diffuse concurrent workers walking the same table sequence.
            if i > 0 {
                let jitter = Duration::from_millis(50 + rand::rng().random_range(0..100));
                tokio::time::sleep(jitter).await;
            }

            self.preload_dictionary(dict, &names).await?;
        }
        Ok(())
    }

    async fn preload_dictionary(&self, dict: Dictionary, names: &[String]) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.try_preload_dictionary(dict, names).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if !is_deadlock(&error_chain(&err)) {
                        return Err(err.context(format!("failed to preload {}", dict.table())));
                    }
                    attempt += 1;
                    if attempt >= MAX_DICTIONARY_ATTEMPTS {
                        return Err(err.context(format!(
                            "failed to preload {} after {} attempts",
                            dict.table(),
                            MAX_DICTIONARY_ATTEMPTS
                        )));
                    }
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
            }
        }
    }

    /// One short transaction for one dictionary table: insert-ignore the
    /// names the cache has not seen, then reload ids for every name the
    /// batch needs — peers may have inserted some of them first.
    async fn try_preload_dictionary(&self, dict: Dictionary, names: &[String]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin dictionary transaction")?;

        let missing = self.cache.missing(dict, names);
        if !missing.is_empty() {
            let sql = format!(
                "INSERT IGNORE INTO {} (name) VALUES {}",
                dict.table(),
                placeholders("(?)", missing.len())
            );
            let mut query = sqlx::query(&sql);
            for name in &missing {
                query = query.bind(name);
            }
            if let Err(err) = query.execute(&mut *tx).await {
                self.push_error(format!("failed to insert {}: {err}", dict.table()));
                return Err(err).context(format!("insert into {}", dict.table()));
            }
        }

        for chunk in names.chunks(DICTIONARY_CHUNK) {
            let sql = format!(
                "SELECT id, name FROM {} WHERE name IN ({})",
                dict.table(),
                placeholders("?", chunk.len())
            );
            let mut query = sqlx::query_as::<_, (i64, String)>(&sql);
            for name in chunk {
                query = query.bind(name);
            }
            let pairs = match query.fetch_all(&mut *tx).await {
                Ok(pairs) => pairs,
                Err(err) => {
                    self.push_error(format!("failed to load {}: {err}", dict.table()));
                    return Err(err).context(format!("select from {}", dict.table()));
                }
            };
            for (id, name) in pairs {
                self.cache.insert(dict, &name, id);
            }
        }

        tx.commit().await.context("failed to commit dictionary transaction")
    }

    // =========================================================================
    // Phase B — geo, companies, links
    // =========================================================================

    async fn insert_geo(&self, tx: &mut Transaction<'_, MySql>, rows: &[CompanyRecord]) -> Result<()> {
        let triples: Vec<GeoTriple> = collect_triples(&self.cache, rows).into_values().collect();
        if triples.is_empty() {
            return Ok(());
        }

        for chunk in triples.chunks(GEO_CHUNK) {
            let sql = format!(
                "INSERT IGNORE INTO geo (region_id, district_id, city_id) VALUES {}",
                placeholders("(?, ?, ?)", chunk.len())
            );
            let mut query = sqlx::query(&sql);
            for &(region, district, city) in chunk {
                query = query.bind(region).bind(district).bind(city);
            }
            if let Err(err) = query.execute(&mut **tx).await {
                self.push_error(format!("failed to insert geo: {err}"));
                return Err(err).context("insert into geo");
            }
        }

        self.load_geo_ids(tx, &triples).await
    }

    /// Resolve the batch's triples back to ids through a Memory-engine probe
    /// table joined on null-safe equality, and fill the geo cache.
    async fn load_geo_ids(&self, tx: &mut Transaction<'_, MySql>, triples: &[GeoTriple]) -> Result<()> {
        let table = format!(
            "geo_probe_{}",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );

        let create = format!(
            "CREATE TEMPORARY TABLE {table} (\
             region_id INT NULL, district_id INT NULL, city_id INT NULL, \
             INDEX idx_probe (region_id, district_id, city_id)\
             ) ENGINE=Memory"
        );
        sqlx::query(&create)
            .execute(&mut **tx)
            .await
            .context("failed to create geo probe table")?;

        for chunk in triples.chunks(GEO_PROBE_CHUNK) {
            let sql = format!(
                "INSERT INTO {table} (region_id, district_id, city_id) VALUES {}",
                placeholders("(?, ?, ?)", chunk.len())
            );
            let mut query = sqlx::query(&sql);
            for &(region, district, city) in chunk {
                query = query.bind(region).bind(district).bind(city);
            }
            query
                .execute(&mut **tx)
                .await
                .context("failed to fill geo probe table")?;
        }

        let select = format!(
            "SELECT g.id, g.region_id, g.district_id, g.city_id \
             FROM geo g \
             INNER JOIN {table} t ON g.region_id <=> t.region_id \
             AND g.district_id <=> t.district_id \
             AND g.city_id <=> t.city_id"
        );
        let found = sqlx::query_as::<_, (i64, Option<i64>, Option<i64>, Option<i64>)>(&select)
            .fetch_all(&mut **tx)
            .await
            .context("failed to load geo ids")?;

        for (id, region, district, city) in found {
            self.cache.insert_geo(&cache::geo_key(region, district, city), id);
        }

        // The probe table dies with the session; no explicit drop.
        Ok(())
    }

    async fn insert_companies(&self, tx: &mut Transaction<'_, MySql>, rows: &[CompanyRecord]) -> Result<()> {
        let names = dictionary_names(Dictionary::Company, rows);
        let missing = self.cache.missing(Dictionary::Company, &names);
        if missing.is_empty() {
            return Ok(());
        }

        let sql = format!(
            "INSERT IGNORE INTO company (name) VALUES {}",
            placeholders("(?)", missing.len())
        );
        let mut query = sqlx::query(&sql);
        for name in &missing {
            query = query.bind(name);
        }
        if let Err(err) = query.execute(&mut **tx).await {
            self.push_error(format!("failed to insert companies: {err}"));
            return Err(err).context("insert into company");
        }

        let sql = format!(
            "SELECT id, name FROM company WHERE name IN ({})",
            placeholders("?", missing.len())
        );
        let mut query = sqlx::query_as::<_, (i64, String)>(&sql);
        for name in &missing {
            query = query.bind(name);
        }
        let pairs = match query.fetch_all(&mut **tx).await {
            Ok(pairs) => pairs,
            Err(err) => {
                self.push_error(format!("failed to load companies: {err}"));
                return Err(err).context("select from company");
            }
        };

        for (id, name) in pairs {
            // Count a company only the first time this loader sees its id.
            if self.cache.insert(Dictionary::Company, &name, id) {
                self.state.write().company_count += 1;
            }
        }
        Ok(())
    }

    async fn insert_links(&self, tx: &mut Transaction<'_, MySql>) -> Result<()> {
        let (geo_pairs, category_pairs, subcategory_pairs) = {
            let state = self.state.read();
            let geo: Vec<(i64, i64)> = state
                .company_geos
                .iter()
                .flat_map(|(&company, geos)| geos.iter().map(move |&geo| (company, geo)))
                .collect();
            let category: Vec<(i64, i64)> = state
                .company_categories
                .iter()
                .flat_map(|(&company, links)| links.category.iter().map(move |&id| (company, id)))
                .collect();
            let subcategory: Vec<(i64, i64)> = state
                .company_categories
                .iter()
                .flat_map(|(&company, links)| links.subcategory.iter().map(move |&id| (company, id)))
                .collect();
            (geo, category, subcategory)
        };

        self.insert_link_rows(tx, "company_geo", "geo_id", &geo_pairs).await?;
        self.insert_link_rows(tx, "company_category", "category_id", &category_pairs).await?;
        self.insert_link_rows(tx, "company_subcategory", "subcategory_id", &subcategory_pairs).await
    }

    async fn insert_link_rows(
        &self,
        tx: &mut Transaction<'_, MySql>,
        table: &str,
        column: &str,
        pairs: &[(i64, i64)],
    ) -> Result<()> {
        for chunk in pairs.chunks(LINK_CHUNK) {
            let sql = format!(
                "INSERT IGNORE INTO {table} (company_id, {column}) VALUES {}",
                placeholders("(?, ?)", chunk.len())
            );
            let mut query = sqlx::query(&sql);
            for &(company_id, value_id) in chunk {
                query = query.bind(company_id).bind(value_id);
            }
            if let Err(err) = query.execute(&mut **tx).await {
                self.push_error(format!("failed to insert {table} links: {err}"));
                return Err(err).context(format!("insert into {table}"));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Batch shaping helpers
// =============================================================================

/// Distinct non-empty names a batch needs from one dictionary, in first-seen
/// order. Category and subcategory values go through tail cleanup first.
fn dictionary_names(dict: Dictionary, rows: &[CompanyRecord]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut names = Vec::new();
    let mut push = |value: &str| {
        if !value.is_empty() && seen.insert(value.to_string()) {
            names.push(value.to_string());
        }
    };

    for row in rows {
        match dict {
            Dictionary::Region => push(&row.region),
            Dictionary::District => push(&row.district),
            Dictionary::City => push(&row.city),
            Dictionary::Company => push(&row.name),
            Dictionary::Category => {
                for token in extract_categories(&row.category) {
                    push(&token);
                }
            }
            Dictionary::Subcategory => {
                for token in extract_categories(&row.subcategory) {
                    push(&token);
                }
            }
        }
    }
    names
}

/// Resolve a row's geography through the cache. `None` when none of the
/// three parts resolves — such a row carries no geo identity at all.
fn resolve_triple(cache: &DictionaryCache, row: &CompanyRecord) -> Option<(String, GeoTriple)> {
    let region = cache.get(Dictionary::Region, &row.region);
    let district = cache.get(Dictionary::District, &row.district);
    let city = cache.get(Dictionary::City, &row.city);
    if region.is_none() && district.is_none() && city.is_none() {
        return None;
    }
    Some((cache::geo_key(region, district, city), (region, district, city)))
}

/// Distinct geo triples used by a batch, keyed by canonical triple key.
fn collect_triples(cache: &DictionaryCache, rows: &[CompanyRecord]) -> HashMap<String, GeoTriple> {
    let mut triples = HashMap::new();
    for row in rows {
        if let Some((key, triple)) = resolve_triple(cache, row) {
            triples.entry(key).or_insert(triple);
        }
    }
    triples
}

/// Fold a batch's resolved links into the collectors. A row without a
/// company id contributes nothing; a row without a geo identity still
/// contributes its category and subcategory links.
fn accumulate_links(cache: &DictionaryCache, state: &mut LoaderState, rows: &[CompanyRecord]) {
    for row in rows {
        let Some(company_id) = cache.get(Dictionary::Company, &row.name) else {
            continue;
        };

        let geo_id = resolve_triple(cache, row).and_then(|(key, _)| cache.geo_id(&key));
        if let Some(geo_id) = geo_id {
            state.company_geos.entry(company_id).or_default().insert(geo_id);
        }

        let category_ids = lookup_ids(cache, Dictionary::Category, &row.category);
        let subcategory_ids = lookup_ids(cache, Dictionary::Subcategory, &row.subcategory);
        if !category_ids.is_empty() || !subcategory_ids.is_empty() {
            let links = state.company_categories.entry(company_id).or_default();
            links.category.extend(category_ids);
            links.subcategory.extend(subcategory_ids);
        }
    }
}

fn lookup_ids(cache: &DictionaryCache, dict: Dictionary, raw: &str) -> Vec<i64> {
    extract_categories(raw)
        .iter()
        .filter_map(|name| cache.get(dict, name))
        .collect()
}

fn build_summary(cache: &DictionaryCache, state: &LoaderState) -> Summary {
    Summary {
        company: state.company_count,
        category: state
            .company_categories
            .values()
            .filter(|links| !links.category.is_empty())
            .count(),
        subcategory: cache.len(Dictionary::Subcategory),
        subcategory_companies: state
            .company_categories
            .values()
            .filter(|links| !links.subcategory.is_empty())
            .count(),
        region: cache.len(Dictionary::Region),
        district: cache.len(Dictionary::District),
        city: cache.len(Dictionary::City),
        errors: state.errors.clone(),
    }
}

/// Split a comma-separated category list, trimming each token. With two or
/// more tokens, the last one is discarded when the original string is
/// suspiciously long (truncated mid-token), the last token is very short in a
/// longer list, or it ends in `/`, `-` or `,`.
pub fn extract_categories(raw: &str) -> Vec<String> {
    if raw.is_empty() {
        return Vec::new();
    }

    let mut tokens: Vec<String> = raw.split(',').map(|token| token.trim().to_string()).collect();

    if tokens.len() > 1 {
        let total_len = raw.chars().count();
        let last = &tokens[tokens.len() - 1];
        let last_len = last.chars().count();
        let last_char = last.chars().last();

        let drop_last = total_len >= TAIL_CLEANUP_MIN_LEN
            || (tokens.len() > 2 && last_len < TAIL_CLEANUP_SHORT_TOKEN)
            || matches!(last_char, Some('/') | Some('-') | Some(','));

        if drop_last {
            tokens.pop();
        }
    }

    tokens
}

/// `"(?)", 3` → `"(?), (?), (?)"`
fn placeholders(group: &str, count: usize) -> String {
    let mut sql = String::with_capacity((group.len() + 2) * count);
    for i in 0..count {
        if i > 0 {
            sql.push_str(", ");
        }
        sql.push_str(group);
    }
    sql
}

// =============================================================================
// Tests
// =============================================================================
