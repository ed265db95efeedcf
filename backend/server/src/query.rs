//! # Listing Search Query
//!
//! Turns UI filters into one SQL statement plus its positional arguments.
//!
//! ## Rules
//! - Empty food type set: no food type constraint
//! - `perishable` and `not_perishable` both set, or both unset: no perishability constraint
//! - Missing expiration bound: no date constraint
//! - An absent argument is never bound as `NULL`; its predicate is left out of
//!   the statement when the query is built
//! - Placeholders are numbered `?1..?n` in the order of [`ListingQuery::args`]
//! - Results are ordered by `expire_date, listing_key`, so identical filters
//!   over unchanged data return identical pages
//!
//! Building is pure. The only failure is a malformed expiration date.
use chrono::NaiveDate;
use serde::Deserialize;

use crate::{
    error::AppError,
    session::{Actor, ActorKey, ActorRole},
    utils::normalize_food_types,
};

pub const MAX_RETRIEVAL_AMOUNT: u32 = 100;
pub const DEFAULT_RETRIEVAL_AMOUNT: u32 = 10;

const SELECT_LISTINGS: &str = "SELECT l.listing_key, l.donor_key, l.food_types, l.perishable, \
l.food_description, l.expire_date, l.image_url, l.quantity, l.claimed_units, l.created_at \
FROM food_listings l";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingsStatus {
    #[default]
    Unclaimed,
    All,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingScope {
    #[default]
    Public,
    Donated,
    Claimed,
    Deliverable,
}

impl ListingScope {
    pub fn required_role(&self) -> Option<ActorRole> {
        match self {
            ListingScope::Public => None,
            ListingScope::Donated => Some(ActorRole::Donor),
            ListingScope::Claimed => Some(ActorRole::Receiver),
            ListingScope::Deliverable => Some(ActorRole::Deliverer),
        }
    }
}

/// Calendar date as picked in the UI date widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DateParts {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListingFilters {
    pub food_types: Vec<String>,
    pub perishable: bool,
    pub not_perishable: bool,
    pub earliest_expire_date: Option<DateParts>,
    pub retrieval_offset: u32,
    pub retrieval_amount: u32,
    pub listings_status: ListingsStatus,
    pub scope: ListingScope,
}

impl Default for ListingFilters {
    fn default() -> Self {
        Self {
            food_types: Vec::new(),
            perishable: false,
            not_perishable: false,
            earliest_expire_date: None,
            retrieval_offset: 0,
            retrieval_amount: DEFAULT_RETRIEVAL_AMOUNT,
            listings_status: ListingsStatus::default(),
            scope: ListingScope::default(),
        }
    }
}

/// Who the listings are scoped to, resolved from the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scoping {
    Everyone,
    DonatedBy(ActorKey),
    ClaimedBy(ActorKey),
    AwaitingDelivery,
}

impl Scoping {
    pub fn resolve(scope: ListingScope, actor: Option<&Actor>) -> Result<Self, AppError> {
        let Some(role) = scope.required_role() else {
            return Ok(Scoping::Everyone);
        };

        let actor = actor.ok_or(AppError::LoginRequired)?;
        actor.require_role(role)?;

        Ok(match scope {
            ListingScope::Public => Scoping::Everyone,
            ListingScope::Donated => Scoping::DonatedBy(actor.key),
            ListingScope::Claimed => Scoping::ClaimedBy(actor.key),
            ListingScope::Deliverable => Scoping::AwaitingDelivery,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryArg {
    Int(i64),
    Bool(bool),
    Text(String),
    Date(NaiveDate),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListingQuery {
    pub sql: String,
    pub args: Vec<QueryArg>,
}

struct Predicates {
    clauses: Vec<String>,
    args: Vec<QueryArg>,
}

impl Predicates {
    fn new() -> Self {
        Self {
            clauses: Vec::new(),
            args: Vec::new(),
        }
    }

    /// Appends `arg` and returns its placeholder.
    fn bind(&mut self, arg: QueryArg) -> String {
        self.args.push(arg);
        format!("?{}", self.args.len())
    }

    fn push(&mut self, clause: String) {
        self.clauses.push(clause);
    }
}

/// `Some(perishable)` only when exactly one of the two flags is set.
pub fn generate_perishability_arg(perishable: bool, not_perishable: bool) -> Option<bool> {
    (perishable != not_perishable).then_some(perishable)
}

pub fn generate_expire_date_arg(date: Option<DateParts>) -> Result<Option<NaiveDate>, AppError> {
    date.map(|DateParts { year, month, day }| {
        NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| {
            AppError::Validation(format!("invalid expiration date {month}/{day}/{year}"))
        })
    })
    .transpose()
}

pub fn build_listing_query(
    filters: &ListingFilters,
    scoping: Scoping,
) -> Result<ListingQuery, AppError> {
    let expire_date = generate_expire_date_arg(filters.earliest_expire_date)?;
    let perishable = generate_perishability_arg(filters.perishable, filters.not_perishable);
    let food_types = normalize_food_types(&filters.food_types);

    let mut predicates = Predicates::new();

    if filters.listings_status == ListingsStatus::Unclaimed {
        predicates.push("l.claimed_units < l.quantity".to_string());
    }

    if !food_types.is_empty() {
        let placeholders: Vec<String> = food_types
            .into_iter()
            .map(|food_type| predicates.bind(QueryArg::Text(food_type)))
            .collect();

        predicates.push(format!(
            "EXISTS (SELECT 1 FROM json_each(l.food_types) ft WHERE ft.value IN ({}))",
            placeholders.join(", ")
        ));
    }

    if let Some(perishable) = perishable {
        let placeholder = predicates.bind(QueryArg::Bool(perishable));
        predicates.push(format!("l.perishable = {placeholder}"));
    }

    if let Some(expire_date) = expire_date {
        let placeholder = predicates.bind(QueryArg::Date(expire_date));
        predicates.push(format!("l.expire_date >= {placeholder}"));
    }

    match scoping {
        Scoping::Everyone => {}
        Scoping::DonatedBy(donor_key) => {
            let placeholder = predicates.bind(QueryArg::Int(donor_key));
            predicates.push(format!("l.donor_key = {placeholder}"));
        }
        Scoping::ClaimedBy(receiver_key) => {
            let placeholder = predicates.bind(QueryArg::Int(receiver_key));
            predicates.push(format!(
                "EXISTS (SELECT 1 FROM claims c WHERE c.listing_key = l.listing_key AND c.receiver_key = {placeholder})"
            ));
        }
        Scoping::AwaitingDelivery => {
            predicates.push(
                "EXISTS (SELECT 1 FROM claims c LEFT JOIN deliveries d ON d.claim_key = c.claim_key \
                 WHERE c.listing_key = l.listing_key AND (d.delivery_key IS NULL OR d.state = 'cancelled'))"
                    .to_string(),
            );
        }
    }

    let limit = predicates.bind(QueryArg::Int(i64::from(
        filters.retrieval_amount.min(MAX_RETRIEVAL_AMOUNT),
    )));
    let offset = predicates.bind(QueryArg::Int(i64::from(filters.retrieval_offset)));

    let mut sql = String::from(SELECT_LISTINGS);
    if !predicates.clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.clauses.join(" AND "));
    }
    sql.push_str(&format!(
        " ORDER BY l.expire_date ASC, l.listing_key ASC LIMIT {limit} OFFSET {offset}"
    ));

    Ok(ListingQuery {
        sql,
        args: predicates.args,
    })
}
