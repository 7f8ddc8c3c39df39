//! Request synthesis.
//!
//! A [`Workload`] turns a random source and the current wall-clock time into
//! one [`RequestSpec`]. It owns the request-kind mix, the nested search
//! target choice and the entity [`Domain`]; nothing in it changes after
//! construction so a single instance is shared by every virtual user.

use std::{fmt, str::FromStr, time::Duration};

use rand::Rng;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    Method, RequestSpec,
    domain::{self, Domain, Entities},
    sparse::{self, Field, JsonBody, QueryString},
    weighted::{self, Weighted},
};

/// Errors produced when building a [`Workload`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq)]
pub enum Error {
    /// See [`weighted::Error`]
    #[error(transparent)]
    Weighted(#[from] weighted::Error),
    /// The amount ceiling must be finite and not negative.
    #[error("amount ceiling {0} is not a finite, non-negative number")]
    AmountCeiling(f64),
}

/// The kinds of request a virtual user sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// `GET /search` with a sparse query string
    SearchGet,
    /// `POST /search` with a sparse JSON body
    SearchPost,
    /// `POST /transfer` with a complete JSON body
    Transfer,
    /// `GET /fail`, sent only by the fault injector
    Failure,
}

impl RequestKind {
    /// The kinds drawn by [`Workload::synthesize`].
    pub const SYNTHESIZED: [Self; 3] = [Self::SearchGet, Self::SearchPost, Self::Transfer];

    /// Label used in logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SearchGet => "search_get",
            Self::SearchPost => "search_post",
            Self::Transfer => "transfer",
            Self::Failure => "failure",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string names no [`RequestKind`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown request kind '{0}', expected one of search_get, search_post, transfer, failure")]
pub struct UnknownKind(String);

impl FromStr for RequestKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "search_get" => Ok(Self::SearchGet),
            "search_post" => Ok(Self::SearchPost),
            "transfer" => Ok(Self::Transfer),
            "failure" => Ok(Self::Failure),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

/// Relative weights of the synthesized request kinds.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Mix {
    /// Weight of `GET /search`
    pub search_get: f64,
    /// Weight of `POST /search`
    pub search_post: f64,
    /// Weight of `POST /transfer`
    pub transfer: f64,
}

impl Mix {
    fn weights(self) -> [f64; 3] {
        [self.search_get, self.search_post, self.transfer]
    }
}

/// Configuration for [`Workload`].
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Request kind weights. Every kind is equally likely when absent.
    pub mix: Option<Mix>,
    /// Upper bound on generated amounts.
    pub amount_ceiling: f64,
    /// How far into the past generated timestamps may reach.
    #[serde(with = "humantime_serde")]
    pub timestamp_window: Duration,
    /// Tenants requests are routed to, chosen uniformly.
    pub tenants: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mix: None,
            amount_ceiling: domain::DEFAULT_AMOUNT_CEILING,
            timestamp_window: domain::DEFAULT_TIMESTAMP_WINDOW,
            tenants: domain::DEFAULT_TENANTS
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

/// What a `GET /search` query refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchTarget {
    Transaction,
    Account,
    Unspecified,
}

impl SearchTarget {
    fn label(self) -> Option<&'static str> {
        match self {
            Self::Transaction => Some("transaction"),
            Self::Account => Some("account"),
            Self::Unspecified => None,
        }
    }
}

/// An immutable request generator.
#[derive(Debug, Clone)]
pub struct Workload {
    kinds: Weighted<RequestKind>,
    search_targets: Weighted<SearchTarget>,
    domain: Domain,
}

impl Workload {
    /// Create a new [`Workload`].
    ///
    /// # Errors
    ///
    /// Returns an error if the mix weights are invalid, no tenant is given or
    /// the amount ceiling is negative or not finite.
    pub fn new(config: &Config) -> Result<Self, Error> {
        if !config.amount_ceiling.is_finite() || config.amount_ceiling < 0.0 {
            return Err(Error::AmountCeiling(config.amount_ceiling));
        }
        let weights = config.mix.map(Mix::weights);
        let kinds = Weighted::with_weights(
            RequestKind::SYNTHESIZED.to_vec(),
            weights.as_ref().map(<[f64; 3]>::as_slice),
        )?;
        let search_targets = Weighted::uniform(vec![
            SearchTarget::Transaction,
            SearchTarget::Account,
            SearchTarget::Unspecified,
        ])?;
        let tenants = Weighted::uniform(config.tenants.clone())?;

        Ok(Self {
            kinds,
            search_targets,
            domain: Domain::new(config.amount_ceiling, config.timestamp_window, tenants),
        })
    }

    /// The entity bounds of this workload.
    #[must_use]
    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    /// Choose a request kind according to the configured mix.
    pub fn choose_kind<R>(&self, rng: &mut R) -> RequestKind
    where
        R: Rng + ?Sized,
    {
        *self.kinds.choose(rng)
    }

    /// Synthesize one request of a kind drawn from the mix.
    pub fn synthesize<R>(&self, rng: &mut R, now: OffsetDateTime) -> RequestSpec
    where
        R: Rng + ?Sized,
    {
        let kind = self.choose_kind(rng);
        self.request(kind, rng, now)
    }

    /// Synthesize one request of the given kind.
    pub fn request<R>(&self, kind: RequestKind, rng: &mut R, now: OffsetDateTime) -> RequestSpec
    where
        R: Rng + ?Sized,
    {
        match kind {
            RequestKind::SearchGet => self.search_get(rng, now),
            RequestKind::SearchPost => self.search_post(rng, now),
            RequestKind::Transfer => self.transfer(rng, now),
            RequestKind::Failure => self.failure_request(rng),
        }
    }

    fn search_get<R>(&self, rng: &mut R, now: OffsetDateTime) -> RequestSpec
    where
        R: Rng + ?Sized,
    {
        let entities = self.domain.entities(rng, now);
        let query = self.search_query(rng, &entities);
        RequestSpec {
            kind: RequestKind::SearchGet,
            method: Method::Get,
            path: "/search",
            headers: host_header(&entities.tenant),
            query,
            body: None,
        }
    }

    fn search_post<R>(&self, rng: &mut R, now: OffsetDateTime) -> RequestSpec
    where
        R: Rng + ?Sized,
    {
        let entities = self.domain.entities(rng, now);
        let body: JsonBody = sparse::compose(
            rng,
            [
                ("timeFrom", Field::Timestamp(entities.from_time)),
                ("timeTo", Field::Timestamp(entities.to_time)),
                ("amountFrom", Field::Amount(entities.from_amount)),
                ("amountTo", Field::Amount(entities.to_amount)),
                ("account", Field::Account(entities.account)),
                (
                    "trxType",
                    Field::TransactionType(entities.transaction_type),
                ),
            ],
        );
        RequestSpec {
            kind: RequestKind::SearchPost,
            method: Method::Post,
            path: "/search",
            headers: host_header(&entities.tenant),
            query: QueryString::default(),
            body: Some(body),
        }
    }

    fn transfer<R>(&self, rng: &mut R, now: OffsetDateTime) -> RequestSpec
    where
        R: Rng + ?Sized,
    {
        let entities = self.domain.entities(rng, now);
        let body: JsonBody = sparse::fill([
            ("fromAccount", Field::Account(entities.from_account)),
            ("toAccount", Field::Account(entities.to_account)),
            ("amount", Field::Amount(entities.amount)),
            (
                "trxType",
                Field::TransactionType(entities.transaction_type),
            ),
            ("time", Field::Timestamp(entities.time)),
        ]);
        RequestSpec {
            kind: RequestKind::Transfer,
            method: Method::Post,
            path: "/transfer",
            headers: host_header(&entities.tenant),
            query: QueryString::default(),
            body: Some(body),
        }
    }

    /// The simulated failure request, `GET /fail`.
    pub fn failure_request<R>(&self, rng: &mut R) -> RequestSpec
    where
        R: Rng + ?Sized,
    {
        RequestSpec {
            kind: RequestKind::Failure,
            method: Method::Get,
            path: "/fail",
            headers: host_header(self.domain.tenant(rng)),
            query: QueryString::default(),
            body: None,
        }
    }

    // `q` is the transaction type when the nested choice is a transaction,
    // the account otherwise. `type` is only a candidate when the nested
    // choice names something.
    fn search_query<R>(&self, rng: &mut R, entities: &Entities) -> QueryString
    where
        R: Rng + ?Sized,
    {
        let target = *self.search_targets.choose(rng);
        let q = match target {
            SearchTarget::Transaction => Field::TransactionType(entities.transaction_type),
            SearchTarget::Account | SearchTarget::Unspecified => Field::Account(entities.account),
        };
        let mut candidates = vec![("q", q)];
        if let Some(label) = target.label() {
            candidates.push(("type", Field::Label(label)));
        }
        sparse::compose(rng, candidates)
    }
}

fn host_header(tenant: &str) -> FxHashMap<String, String> {
    let mut headers = FxHashMap::default();
    headers.insert("Host".to_string(), format!("{tenant}.local"));
    headers
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;
    use rand::{SeedableRng, rngs::SmallRng};
    use rustc_hash::FxHashMap;
    use time::macros::datetime;

    use super::{Config, Error, Mix, RequestKind, Workload};
    use crate::{Method, domain::TransactionType, sparse::Field, weighted};

    const SEARCH_POST_KEYS: [&str; 6] = [
        "timeFrom",
        "timeTo",
        "amountFrom",
        "amountTo",
        "account",
        "trxType",
    ];

    fn workload() -> Workload {
        Workload::new(&Config::default()).expect("default config is valid")
    }

    #[test]
    fn rejects_bad_config() {
        let config = Config {
            amount_ceiling: -1.0,
            ..Config::default()
        };
        assert!(matches!(
            Workload::new(&config),
            Err(Error::AmountCeiling(_))
        ));

        let config = Config {
            tenants: vec![],
            ..Config::default()
        };
        assert_eq!(
            Workload::new(&config).err(),
            Some(Error::Weighted(weighted::Error::Empty))
        );

        let config = Config {
            mix: Some(Mix {
                search_get: 1.0,
                search_post: 0.0,
                transfer: 1.0,
            }),
            ..Config::default()
        };
        assert!(matches!(
            Workload::new(&config),
            Err(Error::Weighted(weighted::Error::InvalidWeight { index: 1, .. }))
        ));
    }

    #[test]
    fn kinds_parse_from_labels() {
        for kind in [
            RequestKind::SearchGet,
            RequestKind::SearchPost,
            RequestKind::Transfer,
            RequestKind::Failure,
        ] {
            assert_eq!(kind.as_str().parse::<RequestKind>(), Ok(kind));
        }
        assert!("transfers".parse::<RequestKind>().is_err());
    }

    #[test]
    fn skewed_mix_makes_transfers_rare() {
        let config = Config {
            mix: Some(Mix {
                search_get: 495.0,
                search_post: 495.0,
                transfer: 10.0,
            }),
            ..Config::default()
        };
        let workload = Workload::new(&config).expect("valid config");
        let mut rng = SmallRng::seed_from_u64(5);
        let mut counts: FxHashMap<RequestKind, usize> = FxHashMap::default();
        for _ in 0..100_000 {
            *counts.entry(workload.choose_kind(&mut rng)).or_default() += 1;
        }
        let transfers = counts.get(&RequestKind::Transfer).copied().unwrap_or(0);
        assert!((700..1_300).contains(&transfers), "{transfers} transfers");
        assert!(!counts.contains_key(&RequestKind::Failure));
    }

    #[test]
    fn failure_request_shape() {
        let mut rng = SmallRng::seed_from_u64(1);
        let request = workload().failure_request(&mut rng);
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.path_and_query(), "/fail");
        assert!(request.body.is_none());
        let host = &request.headers["Host"];
        assert!(["alpha.local", "beta.local", "gamma.local"].contains(&host.as_str()));
    }

    #[test]
    fn each_kind_builds_its_own_request() {
        let workload = workload();
        let mut rng = SmallRng::seed_from_u64(9);
        let now = datetime!(2025-03-01 12:00:00 UTC);
        for (kind, method, path) in [
            (RequestKind::SearchGet, Method::Get, "/search"),
            (RequestKind::SearchPost, Method::Post, "/search"),
            (RequestKind::Transfer, Method::Post, "/transfer"),
            (RequestKind::Failure, Method::Get, "/fail"),
        ] {
            let request = workload.request(kind, &mut rng, now);
            assert_eq!(request.kind, kind);
            assert_eq!(request.method, method);
            assert_eq!(request.path, path);
        }
    }

    #[test]
    fn sub_cent_ceiling_bounds_transfer_amounts() {
        let config = Config {
            amount_ceiling: 0.006,
            ..Config::default()
        };
        let workload = Workload::new(&config).expect("valid workload");
        assert_eq!(workload.domain().amount_ceiling_cents(), 0);

        let mut rng = SmallRng::seed_from_u64(4);
        let now = datetime!(2025-03-01 12:00:00 UTC);
        for _ in 0..1_000 {
            let request = workload.request(RequestKind::Transfer, &mut rng, now);
            let body = request.body.expect("transfer has a body");
            let amount = body
                .fields()
                .iter()
                .find_map(|(key, field)| match field {
                    Field::Amount(amount) if *key == "amount" => Some(*amount),
                    _ => None,
                })
                .expect("transfer carries an amount");
            assert!(amount.as_f64() <= 0.006, "generated {amount}");
        }
    }

    #[test]
    fn every_search_get_shape_occurs() {
        let workload = workload();
        let mut rng = SmallRng::seed_from_u64(17);
        let now = datetime!(2025-03-01 12:00:00 UTC);
        let mut saw_empty = false;
        let mut saw_both = false;
        let mut saw_transaction_q = false;
        for _ in 0..2_000 {
            let request = workload.request(RequestKind::SearchGet, &mut rng, now);
            let keys: Vec<&str> = request.query.pairs().iter().map(|(k, _)| *k).collect();
            saw_empty |= keys.is_empty();
            saw_both |= keys == ["q", "type"];
            saw_transaction_q |= request
                .query
                .pairs()
                .iter()
                .any(|(k, v)| *k == "q" && matches!(v, Field::TransactionType(_)));
        }
        assert!(saw_empty && saw_both && saw_transaction_q);
    }

    proptest! {
        #[test]
        fn transfer_always_has_five_fields(seed: u64) {
            let mut rng = SmallRng::seed_from_u64(seed);
            let now = datetime!(2025-03-01 12:00:00 UTC);
            let request = workload().request(RequestKind::Transfer, &mut rng, now);

            prop_assert_eq!(request.method, Method::Post);
            prop_assert_eq!(request.path, "/transfer");
            prop_assert!(request.query.is_empty());
            let body = request.body.expect("transfer has a body");
            let keys: Vec<&str> = body.keys().collect();
            prop_assert_eq!(keys, vec!["fromAccount", "toAccount", "amount", "trxType", "time"]);
        }

        #[test]
        fn search_get_query_is_consistent(seed: u64) {
            let mut rng = SmallRng::seed_from_u64(seed);
            let now = datetime!(2025-03-01 12:00:00 UTC);
            let request = workload().request(RequestKind::SearchGet, &mut rng, now);

            prop_assert_eq!(request.method, Method::Get);
            prop_assert!(request.body.is_none());
            let pairs = request.query.pairs();
            let q = pairs.iter().find(|(k, _)| *k == "q").map(|(_, v)| *v);
            let kind = pairs.iter().find(|(k, _)| *k == "type").map(|(_, v)| *v);
            prop_assert!(pairs.iter().all(|(k, _)| *k == "q" || *k == "type"));
            match (q, kind) {
                (Some(Field::TransactionType(_)), Some(kind)) => {
                    prop_assert_eq!(kind, Field::Label("transaction"));
                }
                (Some(Field::Account(_)), Some(kind)) => {
                    prop_assert_eq!(kind, Field::Label("account"));
                }
                (_, Some(kind)) => {
                    prop_assert!(kind == Field::Label("account") || kind == Field::Label("transaction"));
                }
                (Some(q), None) => {
                    prop_assert!(matches!(q, Field::Account(_) | Field::TransactionType(_)));
                }
                (None, None) => {}
            }
        }

        #[test]
        fn search_post_body_is_a_subset(seed: u64) {
            let mut rng = SmallRng::seed_from_u64(seed);
            let now = datetime!(2025-03-01 12:00:00 UTC);
            let request = workload().request(RequestKind::SearchPost, &mut rng, now);

            prop_assert_eq!(request.method, Method::Post);
            prop_assert_eq!(request.path_and_query(), "/search");
            let body = request.body.expect("search post has a body");
            for key in body.keys() {
                prop_assert!(SEARCH_POST_KEYS.contains(&key));
            }
        }

        #[test]
        fn synthesized_requests_carry_tenant_host(seed: u64) {
            let mut rng = SmallRng::seed_from_u64(seed);
            let now = datetime!(2025-03-01 12:00:00 UTC);
            let request = workload().synthesize(&mut rng, now);
            prop_assert!(request.kind != RequestKind::Failure);
            let host = request.headers.get("Host").expect("host header");
            prop_assert!(["alpha.local", "beta.local", "gamma.local"].contains(&host.as_str()));
        }
    }

    #[test]
    fn transaction_query_is_encoded() {
        let workload = workload();
        let mut rng = SmallRng::seed_from_u64(23);
        let now = datetime!(2025-03-01 12:00:00 UTC);
        let found = (0..5_000).any(|_| {
            let request = workload.request(RequestKind::SearchGet, &mut rng, now);
            request.query.pairs().iter().any(|(k, v)| {
                *k == "q" && *v == Field::TransactionType(TransactionType::QardHasanah)
            }) && request.path_and_query().contains("q=qard+hasanah")
        });
        assert!(found);
    }
}
