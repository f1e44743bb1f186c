use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::BinDecodable;
use serde::Deserialize;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::model::QueryType;

const MAX_UDP_RESPONSE: usize = 4096;
const MAX_TCP_FRAME: usize = 64 * 1024;

/// Response code of an upstream answer, before normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    NoError,
    NameNotFound,
    Other(u16),
}

/// One answer record as the upstream returned it (any type, any name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerRecord {
    pub name: String,
    pub rtype: RecordType,
    pub value: String,
    pub ttl: u32,
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: ResponseStatus,
    pub answers: Vec<AnswerRecord>,
}

/// A single request/response round trip to one upstream.
///
/// Implementations return `Err` for anything that is not a decodable
/// answer; the executor turns that into a `FAILED` result.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn exchange(&self, qname: &str, qtype: QueryType) -> anyhow::Result<RawResponse>;
}

/// A configured upstream: its URL (for audit) and how to reach it.
#[derive(Clone)]
pub struct Upstream {
    pub url: Arc<str>,
    pub exchange: Arc<dyn Exchange>,
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream").field("url", &self.url).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

impl Upstream {
    pub fn new(url: impl Into<Arc<str>>, exchange: Arc<dyn Exchange>) -> Self {
        Self {
            url: url.into(),
            exchange,
        }
    }

    /// Build an upstream from its URL. See [`Endpoint::parse`] for the accepted forms.
    pub fn from_url(
        url: &str,
        http: &reqwest::Client,
        timeout_dur: Duration,
    ) -> anyhow::Result<Self> {
        let url = url.trim();
        let exchange: Arc<dyn Exchange> = match Endpoint::parse(url)? {
            Endpoint::DohJson => Arc::new(DohJsonExchange::new(http.clone(), url)),
            Endpoint::Wire(addr, transport) => {
                Arc::new(DnsWireExchange::new(addr, transport, timeout_dur))
            }
        };
        Ok(Self::new(url, exchange))
    }
}

/// How an upstream URL is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    DohJson,
    Wire(SocketAddr, Transport),
}

impl Endpoint {
    /// `https://` selects the DoH JSON API, `udp://`/`tcp://` or a bare
    /// `host:port` select DNS wire format.
    pub fn parse(url: &str) -> anyhow::Result<Self> {
        let url = url.trim();
        if url.starts_with("https://") || url.starts_with("http://") {
            reqwest::Url::parse(url).with_context(|| format!("parse upstream url: {}", url))?;
            Ok(Endpoint::DohJson)
        } else if let Some(addr) = url.strip_prefix("tcp://") {
            Ok(Endpoint::Wire(parse_addr(addr)?, Transport::Tcp))
        } else {
            let addr = url.strip_prefix("udp://").unwrap_or(url);
            Ok(Endpoint::Wire(parse_addr(addr)?, Transport::Udp))
        }
    }
}

fn parse_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    addr.parse()
        .with_context(|| format!("invalid upstream address: {}", addr))
}

/// DNS-over-HTTPS using the `application/dns-json` flavour.
pub struct DohJsonExchange {
    client: reqwest::Client,
    url: String,
}

#[derive(Debug, Deserialize)]
struct DohJsonBody {
    #[serde(rename = "Status", default)]
    status: Option<u16>,
    #[serde(rename = "Answer", default)]
    answer: Vec<DohJsonAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohJsonAnswer {
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default)]
    rtype: serde_json::Value,
    #[serde(rename = "TTL", default)]
    ttl: Option<i64>,
    #[serde(default)]
    data: String,
}

impl DohJsonExchange {
    pub fn new(client: reqwest::Client, url: &str) -> Self {
        Self {
            client,
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl Exchange for DohJsonExchange {
    async fn exchange(&self, qname: &str, qtype: QueryType) -> anyhow::Result<RawResponse> {
        let resp = self
            .client
            .get(&self.url)
            .query(&[("name", qname), ("type", qtype.as_str())])
            .header(reqwest::header::ACCEPT, "application/dns-json")
            .send()
            .await
            .context("send doh request")?
            .error_for_status()
            .context("doh upstream status")?;
        let body: DohJsonBody = resp.json().await.context("decode doh json")?;
        Ok(doh_body_to_raw(body, qname))
    }
}

fn doh_body_to_raw(body: DohJsonBody, qname: &str) -> RawResponse {
    // Absent Status means NOERROR.
    let status = match body.status.unwrap_or(0) {
        0 => ResponseStatus::NoError,
        3 => ResponseStatus::NameNotFound,
        other => ResponseStatus::Other(other),
    };
    let answers = body
        .answer
        .into_iter()
        .filter_map(|a| {
            let data = a.data.trim();
            if data.is_empty() {
                return None;
            }
            let rtype = match &a.rtype {
                serde_json::Value::Number(n) => RecordType::from(n.as_u64()? as u16),
                serde_json::Value::String(s) => RecordType::from_str(&s.to_ascii_uppercase()).ok()?,
                _ => return None,
            };
            let ttl = a.ttl.unwrap_or(60).clamp(1, u32::MAX as i64) as u32;
            let name = if a.name.is_empty() {
                qname.to_string()
            } else {
                a.name
            };
            Some(AnswerRecord {
                name,
                rtype,
                value: data.to_string(),
                ttl,
            })
        })
        .collect();
    RawResponse { status, answers }
}

/// Classic DNS wire format over UDP (with TCP fallback) or TCP.
pub struct DnsWireExchange {
    addr: SocketAddr,
    transport: Transport,
    udp_budget: Duration,
    next_id: AtomicU16,
}

impl DnsWireExchange {
    pub fn new(addr: SocketAddr, transport: Transport, timeout_dur: Duration) -> Self {
        // First UDP attempt uses half the budget so the TCP fallback still fits.
        let udp_budget = timeout_dur
            .checked_div(2)
            .unwrap_or(timeout_dur)
            .max(Duration::from_millis(50));
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u16)
            .unwrap_or(1);
        Self {
            addr,
            transport,
            udp_budget,
            next_id: AtomicU16::new(seed),
        }
    }

    async fn send_udp(&self, packet: &[u8], id: u16) -> anyhow::Result<Bytes> {
        let domain = if self.addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket =
            Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
        if let Err(e) = socket.set_recv_buffer_size(256 * 1024) {
            warn!("failed to set udp recv buffer size: {}", e);
        }
        let bind: SocketAddr = if self.addr.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        socket.bind(&bind.into()).context("bind")?;
        socket.set_nonblocking(true).context("set nonblocking")?;
        let sock = UdpSocket::from_std(socket.into()).context("from_std")?;
        sock.connect(self.addr).await?;
        sock.send(packet).await?;

        let mut buf = [0u8; MAX_UDP_RESPONSE];
        let recv = timeout(self.udp_budget, async {
            loop {
                let size = sock.recv(&mut buf).await?;
                // Connected socket: only the upstream can reach us; skip stray ids.
                if size >= 2 && u16::from_be_bytes([buf[0], buf[1]]) == id {
                    return Ok::<_, anyhow::Error>(Bytes::copy_from_slice(&buf[..size]));
                }
            }
        })
        .await;
        match recv {
            Ok(res) => res,
            Err(_) => anyhow::bail!("udp timeout"),
        }
    }

    async fn send_tcp(&self, packet: &[u8]) -> anyhow::Result<Bytes> {
        let mut stream = TcpStream::connect(self.addr)
            .await
            .with_context(|| format!("connect {}", self.addr))?;
        let len = u16::try_from(packet.len()).context("query too large for tcp")?;
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(packet).await?;

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len == 0 || frame_len > MAX_TCP_FRAME {
            anyhow::bail!("invalid tcp frame length {}", frame_len);
        }
        let mut buf = vec![0u8; frame_len];
        stream.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

#[async_trait]
impl Exchange for DnsWireExchange {
    async fn exchange(&self, qname: &str, qtype: QueryType) -> anyhow::Result<RawResponse> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let packet = build_query(id, qname, qtype)?;
        let raw = match self.transport {
            Transport::Tcp => self.send_tcp(&packet).await?,
            Transport::Udp => match self.send_udp(&packet, id).await {
                Ok(bytes) if !is_truncated(&bytes) => bytes,
                Ok(_) => {
                    debug!(event = "udp_truncated", upstream = %self.addr, "retrying over tcp");
                    self.send_tcp(&packet).await?
                }
                Err(err) => {
                    debug!(
                        event = "udp_forward_fallback_tcp",
                        upstream = %self.addr,
                        error = %err,
                        "falling back to tcp"
                    );
                    self.send_tcp(&packet).await?
                }
            },
        };
        decode_response(&raw, id)
    }
}

pub(crate) fn build_query(id: u16, qname: &str, qtype: QueryType) -> anyhow::Result<Vec<u8>> {
    let name = Name::from_ascii(format!("{}.", qname.trim_end_matches('.')))
        .with_context(|| format!("parse query name: {}", qname))?;
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(name, qtype.record_type()));
    Ok(msg.to_vec()?)
}

#[inline]
fn is_truncated(packet: &[u8]) -> bool {
    // TC is bit 1 of the third header byte.
    packet.len() >= 3 && packet[2] & 0x02 != 0
}

pub(crate) fn decode_response(packet: &[u8], expected_id: u16) -> anyhow::Result<RawResponse> {
    let msg = Message::from_bytes(packet).context("parse upstream response")?;
    if msg.id() != expected_id {
        anyhow::bail!("response id mismatch: {} != {}", msg.id(), expected_id);
    }
    let status = match msg.response_code() {
        ResponseCode::NoError => ResponseStatus::NoError,
        ResponseCode::NXDomain => ResponseStatus::NameNotFound,
        other => ResponseStatus::Other(u16::from(other)),
    };
    let answers = msg.answers().iter().filter_map(answer_from_record).collect();
    Ok(RawResponse { status, answers })
}

fn answer_from_record(record: &Record) -> Option<AnswerRecord> {
    let value = match record.data()? {
        RData::A(a) => a.0.to_string(),
        RData::AAAA(aaaa) => aaaa.0.to_string(),
        RData::CNAME(cname) => cname.0.to_utf8(),
        other => other.to_string(),
    };
    Some(AnswerRecord {
        name: record.name().to_utf8(),
        rtype: record.record_type(),
        value,
        ttl: record.ttl(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::{A, CNAME};
    use serde_json::json;

    fn http() -> reqwest::Client {
        reqwest::Client::new()
    }

    #[test]
    fn from_url_selects_transport_by_scheme() {
        let t = Duration::from_millis(500);
        assert!(Upstream::from_url("https://dns.google/resolve", &http(), t).is_ok());
        assert!(Upstream::from_url("udp://1.1.1.1:53", &http(), t).is_ok());
        assert!(Upstream::from_url("tcp://[2606:4700::1111]:53", &http(), t).is_ok());
        assert!(Upstream::from_url("9.9.9.9:53", &http(), t).is_ok());
        assert!(Upstream::from_url("not an upstream", &http(), t).is_err());
        let up = Upstream::from_url(" udp://1.1.1.1:53 ", &http(), t).expect("upstream");
        assert_eq!(up.url.as_ref(), "udp://1.1.1.1:53");
    }

    #[test]
    fn endpoint_parse_reports_wire_transport() {
        let addr: SocketAddr = "1.1.1.1:53".parse().expect("addr");
        assert_eq!(
            Endpoint::parse("1.1.1.1:53").expect("ep"),
            Endpoint::Wire(addr, Transport::Udp)
        );
        assert_eq!(
            Endpoint::parse("tcp://1.1.1.1:53").expect("ep"),
            Endpoint::Wire(addr, Transport::Tcp)
        );
        assert_eq!(
            Endpoint::parse("https://cloudflare-dns.com/dns-query").expect("ep"),
            Endpoint::DohJson
        );
        assert!(Endpoint::parse("udp://dns.example").is_err());
    }

    #[test]
    fn doh_body_maps_status_and_records() {
        let body: DohJsonBody = serde_json::from_value(json!({
            "Status": 0,
            "Answer": [
                { "name": "www.netflix.com", "type": 5, "TTL": 60, "data": "edge.netflix.net." },
                { "name": "edge.netflix.net", "type": "A", "data": "203.0.113.55" },
                { "name": "edge.netflix.net", "type": 1, "TTL": 0, "data": "  " }
            ]
        }))
        .expect("body");
        let raw = doh_body_to_raw(body, "www.netflix.com");
        assert_eq!(raw.status, ResponseStatus::NoError);
        assert_eq!(raw.answers.len(), 2);
        assert_eq!(raw.answers[0].rtype, RecordType::CNAME);
        assert_eq!(raw.answers[1].rtype, RecordType::A);
        assert_eq!(raw.answers[1].ttl, 60);
    }

    #[test]
    fn doh_body_without_status_is_success() {
        let body: DohJsonBody = serde_json::from_value(json!({
            "Answer": [{ "type": 1, "data": "192.0.2.1" }]
        }))
        .expect("body");
        let raw = doh_body_to_raw(body, "x.test");
        assert_eq!(raw.status, ResponseStatus::NoError);
        assert_eq!(raw.answers.len(), 1);
        assert_eq!(raw.answers[0].value, "192.0.2.1");
        let failed: DohJsonBody = serde_json::from_value(json!({ "Status": 2 })).expect("body");
        assert_eq!(doh_body_to_raw(failed, "x.test").status, ResponseStatus::Other(2));
        let nx: DohJsonBody = serde_json::from_value(json!({ "Status": 3 })).expect("body");
        assert_eq!(doh_body_to_raw(nx, "x.test").status, ResponseStatus::NameNotFound);
    }

    #[test]
    fn wire_query_and_response_decode() {
        let packet = build_query(0x1234, "www.example.com", QueryType::A).expect("query");
        let req = Message::from_bytes(&packet).expect("parse query");
        assert_eq!(req.id(), 0x1234);
        assert!(req.recursion_desired());
        assert_eq!(req.queries()[0].query_type(), RecordType::A);

        let mut resp = Message::new();
        resp.set_id(0x1234);
        resp.set_message_type(MessageType::Response);
        resp.set_response_code(ResponseCode::NoError);
        let www = Name::from_ascii("www.example.com.").expect("name");
        let edge = Name::from_ascii("edge.example.net.").expect("name");
        resp.add_answer(Record::from_rdata(www, 30, RData::CNAME(CNAME(edge.clone()))));
        resp.add_answer(Record::from_rdata(edge, 90, RData::A(A(Ipv4Addr::new(192, 0, 2, 7)))));
        let bytes = resp.to_vec().expect("encode");

        let raw = decode_response(&bytes, 0x1234).expect("decode");
        assert_eq!(raw.status, ResponseStatus::NoError);
        assert_eq!(raw.answers.len(), 2);
        assert_eq!(raw.answers[0].value, "edge.example.net.");
        assert_eq!(raw.answers[1].value, "192.0.2.7");
        assert_eq!(raw.answers[1].ttl, 90);
        assert!(!is_truncated(&bytes));

        assert!(decode_response(&bytes, 0x9999).is_err());
    }

    #[test]
    fn nxdomain_rcode_maps_to_name_not_found() {
        let mut resp = Message::new();
        resp.set_id(7);
        resp.set_message_type(MessageType::Response);
        resp.set_response_code(ResponseCode::NXDomain);
        let raw = decode_response(&resp.to_vec().expect("encode"), 7).expect("decode");
        assert_eq!(raw.status, ResponseStatus::NameNotFound);

        resp.set_response_code(ResponseCode::ServFail);
        let raw = decode_response(&resp.to_vec().expect("encode"), 7).expect("decode");
        assert_eq!(raw.status, ResponseStatus::Other(2));
    }
}
