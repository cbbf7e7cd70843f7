//! Redis-backed experiment store.
//!
//! Experiments live in a hash (`doc`, `version`); assignments are JSON
//! strings indexed by an identity key; stats for all variants of one
//! experiment share a hash whose fields are `{variant}|{field}[|{metric}]`.
//! Conditional inserts, the version CAS and the Welford merge run as Lua
//! scripts so each is atomic on the server. Assignment and observation
//! scripts also update the stats hash in the same call.

use async_trait::async_trait;
use experiment_core::accumulator::metric_from_raw;
use experiment_core::config::RedisConfig;
use experiment_core::error::{StoreError, StoreResult};
use experiment_core::types::{Assignment, Experiment, MetricKind, Observation, VariantStats};
use experiment_core::{ExperimentStore, StatsDelta};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

const INSERT_EXPERIMENT: &str = r#"
if redis.call('HSETNX', KEYS[1], 'doc', ARGV[1]) == 1 then
  redis.call('HSET', KEYS[1], 'version', ARGV[2])
  return 1
end
return 0
"#;

const UPDATE_EXPERIMENT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if not current or tonumber(current) ~= tonumber(ARGV[2]) then
  return 0
end
redis.call('HSET', KEYS[1], 'doc', ARGV[1], 'version', tostring(tonumber(ARGV[2]) + 1))
return 1
"#;

const INSERT_ASSIGNMENT: &str = r#"
local existing = redis.call('GET', KEYS[1])
if existing then
  return redis.call('GET', ARGV[3] .. existing)
end
redis.call('SET', KEYS[2], ARGV[2])
redis.call('SET', KEYS[1], ARGV[1])
if ARGV[4] ~= '' then
  redis.call('HINCRBY', KEYS[3], ARGV[4] .. '|assignments', 1)
end
return ARGV[2]
"#;

// KEYS: observations list, stats hash.
// ARGV: observation json, variant, metric, kind, value; an empty metric
// appends without aggregating.
const RECORD_OBSERVATION: &str = r#"
redis.call('RPUSH', KEYS[1], ARGV[1])
if ARGV[3] == '' then
  return 0
end
local key = KEYS[2]
local variant = ARGV[2]
local metric = ARGV[3]
local x = tonumber(ARGV[5])
local function f(name) return variant .. '|' .. name .. '|' .. metric end
local kind = redis.call('HGET', key, f('kind'))
if not kind then
  kind = ARGV[4]
  redis.call('HSET', key, f('kind'), kind)
end
local n = redis.call('HINCRBY', key, f('observations'), 1)
if kind == 'binary' then
  if x > 0 then
    redis.call('HINCRBY', key, f('successes'), 1)
  else
    redis.call('HINCRBY', key, f('failures'), 1)
  end
  return n
end
local mean = tonumber(redis.call('HGET', key, f('mean')) or '0')
local m2 = tonumber(redis.call('HGET', key, f('m2')) or '0')
local delta = x - mean
mean = mean + delta / n
m2 = m2 + delta * (x - mean)
redis.call('HSET', key,
  f('mean'), string.format('%.17g', mean),
  f('m2'), string.format('%.17g', m2))
redis.call('HINCRBYFLOAT', key, f('sum'), ARGV[5])
return n
"#;

pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    insert_experiment: Script,
    update_experiment: Script,
    insert_assignment: Script,
    record_observation: Script,
}

impl RedisStore {
    /// Connect to the first configured Redis node.
    pub async fn new(config: &RedisConfig) -> anyhow::Result<Self> {
        let url = config
            .urls
            .first()
            .cloned()
            .unwrap_or_else(|| "redis://localhost:6379".to_string());

        info!(url = %url, "Connecting to Redis");

        let client = redis::Client::open(url.as_str())?;
        let mut conn = ConnectionManager::new(client).await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!(response = %pong, "Redis connection established");

        Ok(Self {
            conn,
            prefix: config.key_prefix.clone(),
            insert_experiment: Script::new(INSERT_EXPERIMENT),
            update_experiment: Script::new(UPDATE_EXPERIMENT),
            insert_assignment: Script::new(INSERT_ASSIGNMENT),
            record_observation: Script::new(RECORD_OBSERVATION),
        })
    }

    fn experiment_key(&self, id: &Uuid) -> String {
        format!("{}:experiment:{id}", self.prefix)
    }

    fn assignment_prefix(&self) -> String {
        format!("{}:assignment:", self.prefix)
    }

    fn identity_key(&self, experiment_id: &Uuid, identity: &str) -> String {
        format!("{}:identity:{experiment_id}:{identity}", self.prefix)
    }

    fn observations_key(&self, experiment_id: &Uuid) -> String {
        format!("{}:observations:{experiment_id}", self.prefix)
    }

    fn stats_key(&self, experiment_id: &Uuid) -> String {
        format!("{}:stats:{experiment_id}", self.prefix)
    }
}

fn backend(err: redis::RedisError) -> StoreError {
    metrics::counter!("store.redis.errors").increment(1);
    StoreError::Backend(err.to_string())
}

#[async_trait]
impl ExperimentStore for RedisStore {
    async fn insert_experiment(&self, experiment: &Experiment) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let doc = serde_json::to_string(experiment)?;
        let inserted: i64 = self
            .insert_experiment
            .key(self.experiment_key(&experiment.id))
            .arg(doc)
            .arg(experiment.version)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(inserted == 1)
    }

    async fn get_experiment(&self, id: Uuid) -> StoreResult<Option<Experiment>> {
        let mut conn = self.conn.clone();
        let (doc, version): (Option<String>, Option<u64>) = redis::cmd("HMGET")
            .arg(self.experiment_key(&id))
            .arg("doc")
            .arg("version")
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        match doc {
            Some(json) => {
                let mut experiment: Experiment = serde_json::from_str(&json)?;
                experiment.version = version.unwrap_or(experiment.version);
                Ok(Some(experiment))
            }
            None => Ok(None),
        }
    }

    async fn update_experiment(
        &self,
        experiment: &Experiment,
        expected_version: u64,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let mut next = experiment.clone();
        next.version = expected_version + 1;
        let doc = serde_json::to_string(&next)?;
        let swapped: i64 = self
            .update_experiment
            .key(self.experiment_key(&experiment.id))
            .arg(doc)
            .arg(expected_version)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(swapped == 1)
    }

    async fn find_assignment(
        &self,
        experiment_id: Uuid,
        identity_key: &str,
    ) -> StoreResult<Option<Assignment>> {
        let mut conn = self.conn.clone();
        let id: Option<String> = conn
            .get(self.identity_key(&experiment_id, identity_key))
            .await
            .map_err(backend)?;
        let Some(id) = id else {
            return Ok(None);
        };
        let json: Option<String> = conn
            .get(format!("{}{id}", self.assignment_prefix()))
            .await
            .map_err(backend)?;
        json.map(|j| serde_json::from_str(&j)).transpose().map_err(Into::into)
    }

    async fn get_assignment(&self, id: Uuid) -> StoreResult<Option<Assignment>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn
            .get(format!("{}{id}", self.assignment_prefix()))
            .await
            .map_err(backend)?;
        json.map(|j| serde_json::from_str(&j)).transpose().map_err(Into::into)
    }

    async fn insert_assignment_if_absent(
        &self,
        assignment: &Assignment,
    ) -> StoreResult<Assignment> {
        let mut conn = self.conn.clone();
        let identity = self.identity_key(&assignment.experiment_id, &assignment.identity_key);
        let counted_variant = if assignment.enrolled {
            assignment.variant_id.to_string()
        } else {
            String::new()
        };
        let stored: Option<String> = self
            .insert_assignment
            .key(&identity)
            .key(format!("{}{}", self.assignment_prefix(), assignment.id))
            .key(self.stats_key(&assignment.experiment_id))
            .arg(assignment.id.to_string())
            .arg(serde_json::to_string(assignment)?)
            .arg(self.assignment_prefix())
            .arg(counted_variant)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        match stored {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(StoreError::Corrupt {
                key: identity,
                reason: "identity points at a missing assignment".into(),
            }),
        }
    }

    async fn record_observation(
        &self,
        observation: &Observation,
        delta: Option<&StatsDelta>,
    ) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let (metric, kind, value) = match delta {
            Some(StatsDelta::Observation { metric, kind, value }) => {
                (metric.as_str(), kind.as_str(), value.to_string())
            }
            Some(StatsDelta::Assignment) | None => ("", "", String::new()),
        };
        let _: i64 = self
            .record_observation
            .key(self.observations_key(&observation.experiment_id))
            .key(self.stats_key(&observation.experiment_id))
            .arg(serde_json::to_string(observation)?)
            .arg(observation.variant_id.to_string())
            .arg(metric)
            .arg(kind)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn load_stats(&self, experiment_id: Uuid) -> StoreResult<HashMap<Uuid, VariantStats>> {
        let mut conn = self.conn.clone();
        let key = self.stats_key(&experiment_id);
        let fields: HashMap<String, String> = conn.hgetall(&key).await.map_err(backend)?;
        stats_from_fields(&key, &fields)
    }
}

#[derive(Default)]
struct RawMetric {
    kind: Option<MetricKind>,
    observations: u64,
    successes: u64,
    failures: u64,
    sum: f64,
    mean: f64,
    m2: f64,
}

/// Rebuild per-variant stats from the flat stats hash.
fn stats_from_fields(
    key: &str,
    fields: &HashMap<String, String>,
) -> StoreResult<HashMap<Uuid, VariantStats>> {
    let corrupt = |reason: String| StoreError::Corrupt {
        key: key.to_string(),
        reason,
    };
    let mut assignments: HashMap<Uuid, u64> = HashMap::new();
    let mut raw: HashMap<(Uuid, String), RawMetric> = HashMap::new();

    for (field, value) in fields {
        let mut parts = field.splitn(3, '|');
        let variant = parts.next().unwrap_or_default();
        let name = parts.next().unwrap_or_default();
        let metric = parts.next();
        let variant_id = Uuid::parse_str(variant).map_err(|e| corrupt(format!("{field}: {e}")))?;

        let int = || value.parse::<u64>().map_err(|e| corrupt(format!("{field}: {e}")));
        let float = || value.parse::<f64>().map_err(|e| corrupt(format!("{field}: {e}")));

        let Some(metric) = metric else {
            if name == "assignments" {
                assignments.insert(variant_id, int()?);
            }
            continue;
        };
        let entry = raw.entry((variant_id, metric.to_string())).or_default();
        match name {
            "kind" => {
                entry.kind = Some(match value.as_str() {
                    "binary" => MetricKind::Binary,
                    "continuous" => MetricKind::Continuous,
                    other => return Err(corrupt(format!("unknown metric kind {other}"))),
                })
            }
            "observations" => entry.observations = int()?,
            "successes" => entry.successes = int()?,
            "failures" => entry.failures = int()?,
            "sum" => entry.sum = float()?,
            "mean" => entry.mean = float()?,
            "m2" => entry.m2 = float()?,
            _ => {}
        }
    }

    let mut stats: HashMap<Uuid, VariantStats> = HashMap::new();
    for (variant_id, count) in assignments {
        stats.entry(variant_id).or_default().assignments = count;
    }
    for ((variant_id, metric), r) in raw {
        let kind = r.kind.unwrap_or(MetricKind::Continuous);
        let m = metric_from_raw(kind, r.observations, r.successes, r.failures, r.sum, r.mean, r.m2);
        stats.entry(variant_id).or_default().metrics.insert(metric, m);
    }
    Ok(stats)
}
