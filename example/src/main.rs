use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use workpool::{ContextState, Invocation, PoolEvent, PoolRegistry};

const RECORDS: usize = 20_000;

/// How one source field maps onto the normalized record
struct FieldRule {
    from: &'static str,
    to: &'static str,
    transform: Transform,
}

#[derive(Clone, Copy)]
enum Transform {
    Keep,
    Email,
    Date,
}

/// Per-unit parser state, built once by the context initializer
struct CustomerSchema {
    fields: Vec<FieldRule>,
}

impl CustomerSchema {
    fn new() -> Self {
        Self {
            fields: vec![
                FieldRule {
                    from: "id",
                    to: "id",
                    transform: Transform::Keep,
                },
                FieldRule {
                    from: "name",
                    to: "name",
                    transform: Transform::Keep,
                },
                FieldRule {
                    from: "email",
                    to: "email",
                    transform: Transform::Email,
                },
                FieldRule {
                    from: "registrationDate",
                    to: "createdAt",
                    transform: Transform::Date,
                },
            ],
        }
    }

    fn parse(&self, record: &Value) -> Result<Value> {
        let mut out = Map::new();
        for rule in &self.fields {
            let Some(value) = record.get(rule.from) else {
                continue;
            };
            let value = match rule.transform {
                Transform::Keep => value.clone(),
                Transform::Email => {
                    let email = value
                        .as_str()
                        .ok_or_else(|| anyhow!("{} is not a string", rule.from))?;
                    if !is_email(email) {
                        return Err(anyhow!("invalid email '{}'", email));
                    }
                    json!(email.to_lowercase())
                }
                Transform::Date => {
                    let raw = value
                        .as_str()
                        .ok_or_else(|| anyhow!("{} is not a string", rule.from))?;
                    let parsed = DateTime::parse_from_rfc3339(raw)
                        .with_context(|| format!("bad date '{}'", raw))?;
                    json!(parsed.with_timezone(&Utc).to_rfc3339())
                }
            };
            out.insert(rule.to.to_string(), value);
        }
        Ok(Value::Object(out))
    }
}

fn is_email(s: &str) -> bool {
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return false;
    };
    !local.is_empty()
        && local
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._%+-".contains(c))
        && !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || ".-".contains(c))
        && tld.len() >= 2
        && tld.chars().all(|c| c.is_ascii_alphabetic())
}

fn customer(id: usize) -> Value {
    let email = if id % 997 == 0 {
        format!("customer{}-at-example.com", id)
    } else {
        format!("Customer.{}@Example.COM", id)
    };
    json!({
        "id": id,
        "name": format!("Customer {}", id),
        "email": email,
        "phoneNumber": format!("(555) {:03}-{:04}", id % 1000, id % 10000),
        "city": "Springfield",
        "registrationDate": format!("2023-{:02}-{:02}T10:15:00.000Z", id % 12 + 1, id % 28 + 1),
    })
}

async fn parser_line(call: Invocation) -> Result<Value> {
    let schema = call
        .context()
        .and_then(|ctx| ctx.state::<CustomerSchema>())
        .ok_or_else(|| anyhow!("customer schema not initialized"))?;
    let payload = call.data().ok_or_else(|| anyhow!("missing payload"))?;
    Ok(json!({
        "index": payload["index"],
        "data": schema.parse(&payload["value"])?,
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let registry = PoolRegistry::new();
    let pool = registry.create_pool(
        registry
            .pool_config("parserLine", parser_line)
            .worker_count(3)
            .context_initializer(|| async {
                Ok::<ContextState, anyhow::Error>(Arc::new(CustomerSchema::new()))
            }),
    )?;

    let mut events = pool.subscribe();
    let ready = pool.await_start().await?;
    info!(ready, "Parser pool started");

    let start = Instant::now();
    for index in 0..RECORDS {
        pool.send(json!({ "value": customer(index + 1), "index": index }))?;
    }
    pool.end_of_input();

    let mut final_data: Vec<Option<Value>> = vec![None; RECORDS];
    let mut rejected = 0usize;
    while let Some(event) = events.recv().await {
        match event {
            PoolEvent::Result(result) => match result.outcome {
                Ok(mut response) => {
                    if let Some(index) = response["index"].as_u64() {
                        final_data[index as usize] = Some(response["data"].take());
                    }
                }
                Err(e) => {
                    rejected += 1;
                    warn!(seq = result.seq, error = %e, "Record rejected");
                }
            },
            PoolEvent::Error(e) => warn!(error = %e, "Pool error"),
            PoolEvent::End(summary) => {
                info!(
                    parsed = summary.succeeded(),
                    rejected,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Parallel parser finished"
                );
                break;
            }
        }
    }

    if let Some(first) = final_data.iter().flatten().next() {
        println!("{}", serde_json::to_string_pretty(first)?);
    }

    let schema = CustomerSchema::new();
    let start = Instant::now();
    let sequential = (1..=RECORDS)
        .filter(|id| schema.parse(&customer(*id)).is_ok())
        .count();
    info!(
        parsed = sequential,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Sequential parser finished"
    );

    Ok(())
}
