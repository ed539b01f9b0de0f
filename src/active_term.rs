//! Current-active-term selection and persistence.
//!
//! Selection is a pure function over the candidate list and a date; the
//! persisted row is one `CurrentActiveTerm` per section, indexed by
//! `lastUpdated` so hosts can ask "which sections changed since T".

use chrono::NaiveDate;
use serde_json::json;

use crate::model::{from_value, to_value, CurrentActiveTerm, Term};
use crate::object_store::{IndexQuery, ObjectStore};
use crate::stores::{Key, StoreName};
use crate::time::{now_ms, parse_iso_date};
use crate::AppResult;

/// Picks the current term for a section:
/// 1. a term containing `today` (first match wins),
/// 2. else the future term with the earliest start,
/// 3. else the past term with the latest end,
/// 4. else `None` (empty or unparseable input).
pub fn resolve_current_term<'a>(terms: &'a [Term], today: NaiveDate) -> Option<&'a Term> {
    let parsed: Vec<(&Term, NaiveDate, NaiveDate)> = terms
        .iter()
        .filter_map(|term| {
            let start = parse_iso_date(&term.startdate)?;
            let end = parse_iso_date(&term.enddate)?;
            Some((term, start, end))
        })
        .collect();

    if let Some((term, _, _)) = parsed
        .iter()
        .find(|(_, start, end)| *start <= today && today <= *end)
    {
        return Some(term);
    }

    if let Some((term, _, _)) = parsed
        .iter()
        .filter(|(_, start, _)| *start > today)
        .min_by_key(|(_, start, _)| *start)
    {
        return Some(term);
    }

    parsed
        .iter()
        .filter(|(_, _, end)| *end < today)
        .max_by_key(|(_, _, end)| *end)
        .map(|(term, _, _)| *term)
}

/// Resolves and persists the active term for a section. Returns the stored
/// row, or `None` when no candidate term parses.
pub async fn update_current_active_term(
    store: &ObjectStore,
    section_id: &str,
    terms: &[Term],
    today: NaiveDate,
) -> AppResult<Option<CurrentActiveTerm>> {
    let Some(term) = resolve_current_term(terms, today) else {
        tracing::warn!(
            target = "vikingbase",
            event = "active_term_unresolved",
            section_id,
            candidates = terms.len()
        );
        return Ok(None);
    };

    let row = CurrentActiveTerm {
        section_id: section_id.to_string(),
        current_term_id: term.termid.clone(),
        term_name: term.name.clone(),
        start_date: Some(term.startdate.clone()),
        end_date: Some(term.enddate.clone()),
        last_updated: now_ms(),
    };
    store
        .put(StoreName::CurrentActiveTerms, &to_value(&row)?)
        .await?;
    Ok(Some(row))
}

pub async fn get_current_active_term(
    store: &ObjectStore,
    section_id: &str,
) -> AppResult<Option<CurrentActiveTerm>> {
    let value = store
        .get(StoreName::CurrentActiveTerms, &Key::from(section_id))
        .await?;
    value.map(from_value).transpose()
}

/// Sections whose active term was refreshed at or after `since_ms`, via the
/// `lastUpdated` index lower bound.
pub async fn get_terms_updated_since(
    store: &ObjectStore,
    since_ms: i64,
) -> AppResult<Vec<CurrentActiveTerm>> {
    let rows = store
        .get_all_from_index(
            StoreName::CurrentActiveTerms,
            "lastUpdated",
            IndexQuery::LowerBound(json!(since_ms)),
        )
        .await?;
    rows.into_iter().map(from_value).collect()
}
