//! Scripted upstreams and a manual clock shared by the unit tests.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::rr::RecordType;

use crate::engine::Clock;
use crate::model::QueryType;
use crate::transport::{AnswerRecord, Exchange, RawResponse, ResponseStatus, Upstream};

#[derive(Debug, Clone)]
pub enum Reply {
    Answer(RawResponse),
    /// A records owned by whichever name was asked for.
    Addresses(Vec<(String, u32)>),
    Fail,
    Hang,
}

struct Script {
    reply: Reply,
    delay: Duration,
}

pub struct ScriptedExchange {
    script: Mutex<Script>,
    calls: AtomicUsize,
}

impl ScriptedExchange {
    pub fn new(reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(Script {
                reply,
                delay: Duration::ZERO,
            }),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn upstream(url: &str, reply: Reply) -> (Upstream, Arc<Self>) {
        let exchange = Self::new(reply);
        (Upstream::new(url, exchange.clone()), exchange)
    }

    pub fn set_reply(&self, reply: Reply) {
        self.script.lock().unwrap().reply = reply;
    }

    pub fn set_delay(&self, delay: Duration) {
        self.script.lock().unwrap().delay = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Exchange for ScriptedExchange {
    async fn exchange(&self, qname: &str, _qtype: QueryType) -> anyhow::Result<RawResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (reply, delay) = {
            let script = self.script.lock().unwrap();
            (script.reply.clone(), script.delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match reply {
            Reply::Answer(raw) => Ok(raw),
            Reply::Addresses(addrs) => Ok(ok_response(
                addrs
                    .iter()
                    .map(|(addr, ttl)| answer(qname, RecordType::A, addr, *ttl))
                    .collect(),
            )),
            Reply::Fail => anyhow::bail!("scripted failure"),
            Reply::Hang => Ok(std::future::pending::<RawResponse>().await),
        }
    }
}

pub fn answer(name: &str, rtype: RecordType, value: &str, ttl: u32) -> AnswerRecord {
    AnswerRecord {
        name: name.to_string(),
        rtype,
        value: value.to_string(),
        ttl,
    }
}

pub fn cname(name: &str, target: &str, ttl: u32) -> AnswerRecord {
    answer(name, RecordType::CNAME, target, ttl)
}

pub fn ok_response(answers: Vec<AnswerRecord>) -> RawResponse {
    RawResponse {
        status: ResponseStatus::NoError,
        answers,
    }
}

/// A answers for `name`, one per `(address, ttl)`.
pub fn a_response(name: &str, addrs: &[(&str, u32)]) -> RawResponse {
    ok_response(
        addrs
            .iter()
            .map(|(addr, ttl)| answer(name, RecordType::A, addr, *ttl))
            .collect(),
    )
}

pub fn nxdomain() -> RawResponse {
    RawResponse {
        status: ResponseStatus::NameNotFound,
        answers: Vec::new(),
    }
}

/// Unix-seconds clock that only moves when told to.
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(start: u64) -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(start)))
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}
