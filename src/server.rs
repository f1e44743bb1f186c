use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, Record};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable, BinEncoder};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, error, info};

use crate::engine::Engine;
use crate::error::ResolveError;
use crate::model::{QueryType, ResolveOutcome, ResolveStatus};

const MAX_UDP_PACKET: usize = 4096;
const MAX_TCP_FRAME: usize = 64 * 1024;

/// Answer DNS queries over UDP and TCP until the TCP listener fails.
pub async fn serve(
    engine: Engine,
    bind_udp: SocketAddr,
    bind_tcp: SocketAddr,
    udp_workers: usize,
) -> anyhow::Result<()> {
    let udp_socket = Arc::new(
        UdpSocket::from_std(bind_udp_socket(bind_udp)?).context("register udp socket")?,
    );
    let udp_workers = udp_workers.max(1);
    for worker_id in 0..udp_workers {
        let engine = engine.clone();
        let socket = Arc::clone(&udp_socket);
        tokio::spawn(async move {
            if let Err(err) = run_udp_worker(worker_id, socket, engine).await {
                error!(worker_id, error = %err, "udp worker exited");
            }
        });
    }

    let tcp_listener = TcpListener::bind(bind_tcp)
        .await
        .context("bind tcp listener")?;
    info!(bind_udp = %bind_udp, bind_tcp = %bind_tcp, udp_workers, "dns server started");
    run_tcp(tcp_listener, engine).await
}

/// One shared UDP socket with enlarged kernel buffers.
fn bind_udp_socket(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true).context("set nonblocking")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind udp socket: {}", addr))?;
    Ok(socket.into())
}

async fn run_udp_worker(
    worker_id: usize,
    socket: Arc<UdpSocket>,
    engine: Engine,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; MAX_UDP_PACKET];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(err) => {
                debug!(worker_id, error = %err, "udp recv failed");
                continue;
            }
        };
        let packet = Bytes::copy_from_slice(&buf[..len]);
        let engine = engine.clone();
        let socket = Arc::clone(&socket);
        // Upstream refreshes can take a while; never block the receive loop.
        tokio::spawn(async move {
            match handle_query(&engine, &packet).await {
                Ok(resp) => {
                    let _ = socket.send_to(&resp, peer).await;
                }
                Err(err) => debug!(peer = %peer, error = %err, "dropping undecodable packet"),
            }
        });
    }
}

async fn run_tcp(listener: TcpListener, engine: Engine) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_tcp_conn(stream, &engine).await {
                debug!(peer = %peer, error = %err, "tcp connection closed with error");
            }
        });
    }
}

async fn handle_tcp_conn(mut stream: TcpStream, engine: &Engine) -> anyhow::Result<()> {
    while let Some(frame) = read_frame(&mut stream).await? {
        let resp = handle_query(engine, &frame).await?;
        let Ok(len) = u16::try_from(resp.len()) else {
            debug!(len = resp.len(), "response too large for tcp frame");
            return Ok(());
        };
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(&resp).await?;
    }
    Ok(())
}

/// Next length-prefixed query, or `None` once the client is done.
async fn read_frame(stream: &mut TcpStream) -> anyhow::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 2];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let frame_len = usize::from(u16::from_be_bytes(len_buf));
    if frame_len == 0 || frame_len > MAX_TCP_FRAME {
        return Ok(None);
    }
    let mut frame = vec![0u8; frame_len];
    stream.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

/// Decode one DNS query, resolve it through the engine and encode the reply.
pub async fn handle_query(engine: &Engine, packet: &[u8]) -> anyhow::Result<Bytes> {
    let req = Message::from_bytes(packet).context("decode dns query")?;
    let Some(query) = req.queries().first() else {
        return encode(response_to(&req, ResponseCode::FormErr));
    };
    let Ok(qtype) = QueryType::try_from(query.query_type()) else {
        return encode(response_to(&req, ResponseCode::NotImp));
    };

    let result = engine.resolve_query(&query.name().to_utf8(), qtype).await;
    if let Err(err) = &result {
        debug!(qname = %query.name(), qtype = %qtype, kind = err.kind(), "resolve failed");
    }
    encode(build_response(&req, query.name(), result))
}

/// Reply to `req` carrying the outcome's addresses under the question name.
fn build_response(
    req: &Message,
    owner: &Name,
    result: Result<ResolveOutcome, ResolveError>,
) -> Message {
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(err) => return response_to(req, rcode_for(&err)),
    };
    let rcode = match outcome.status {
        ResolveStatus::Ok => ResponseCode::NoError,
        ResolveStatus::NameNotFound => ResponseCode::NXDomain,
    };
    let mut msg = response_to(req, rcode);
    for record in &outcome.records {
        if let Some(answer) = answer_record(owner, &record.value, outcome.ttl_seconds) {
            msg.add_answer(answer);
        }
    }
    msg
}

fn rcode_for(err: &ResolveError) -> ResponseCode {
    match err {
        ResolveError::UpstreamExhausted { .. } | ResolveError::ConfigurationInvalid(_) => {
            ResponseCode::ServFail
        }
        ResolveError::UnsupportedQueryType(_) => ResponseCode::NotImp,
        ResolveError::InvalidName(_) => ResponseCode::FormErr,
    }
}

/// Address record owned by the question name.
fn answer_record(owner: &Name, value: &str, ttl: u32) -> Option<Record> {
    let rdata = match value.parse::<IpAddr>().ok()? {
        IpAddr::V4(v4) => RData::A(A(v4)),
        IpAddr::V6(v6) => RData::AAAA(AAAA(v6)),
    };
    Some(Record::from_rdata(owner.clone(), ttl, rdata))
}

/// Empty response header echoing the request's id, flags and question.
fn response_to(req: &Message, rcode: ResponseCode) -> Message {
    let mut msg = Message::new();
    msg.set_id(req.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(req.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(rcode);
    msg.add_queries(req.queries().iter().cloned());
    msg
}

fn encode(msg: Message) -> anyhow::Result<Bytes> {
    let mut out = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut out);
        msg.emit(&mut encoder).context("encode dns response")?;
    }
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::testutil::{ManualClock, Reply, ScriptedExchange, a_response, nxdomain};
    use hickory_proto::op::Query;
    use hickory_proto::rr::RecordType;
    use std::str::FromStr;
    use std::time::Duration;
    use tokio::time::timeout;

    fn engine(replies: Vec<Reply>) -> Engine {
        let upstreams = replies
            .into_iter()
            .enumerate()
            .map(|(i, reply)| ScriptedExchange::upstream(&format!("u{}", i), reply).0)
            .collect();
        Engine::with_upstreams(&EngineConfig::default(), upstreams, ManualClock::new(1_000))
            .expect("engine")
    }

    fn query(id: u16, name: &str, rtype: RecordType) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_str(name).expect("name"), rtype));
        msg.to_vec().expect("encode")
    }

    fn decode(bytes: &[u8]) -> Message {
        Message::from_bytes(bytes).expect("decode")
    }

    async fn ask(engine: &Engine, id: u16, name: &str, rtype: RecordType) -> Message {
        let resp = handle_query(engine, &query(id, name, rtype)).await.expect("response");
        decode(&resp)
    }

    #[tokio::test]
    async fn answers_carry_question_name_and_remaining_ttl() {
        let engine = engine(vec![
            Reply::Answer(a_response("example.com", &[("192.0.2.1", 90), ("192.0.2.2", 90)])),
            Reply::Answer(a_response("example.com", &[("192.0.2.2", 80), ("192.0.2.1", 80)])),
        ]);
        let resp = handle_query(&engine, &query(0x4242, "Example.com.", RecordType::A))
            .await
            .expect("response");
        let msg = decode(&resp);
        assert_eq!(msg.id(), 0x4242);
        assert_eq!(msg.message_type(), MessageType::Response);
        assert_eq!(msg.response_code(), ResponseCode::NoError);
        assert!(msg.recursion_available());
        assert_eq!(msg.queries().len(), 1);
        assert_eq!(msg.answers().len(), 2);
        for record in msg.answers() {
            assert!(record.name().to_utf8().eq_ignore_ascii_case("example.com."));
            assert_eq!(record.ttl(), 80);
        }
        assert!(matches!(
            msg.answers()[0].data(),
            Some(RData::A(A(ip))) if ip.to_string() == "192.0.2.1"
        ));
    }

    #[tokio::test]
    async fn errors_map_to_response_codes() {
        let nx = engine(vec![Reply::Answer(nxdomain()), Reply::Answer(nxdomain())]);
        let msg = ask(&nx, 1, "missing.test.", RecordType::A).await;
        assert_eq!(msg.response_code(), ResponseCode::NXDomain);
        assert!(msg.answers().is_empty());

        let down = engine(vec![Reply::Fail, Reply::Fail]);
        let msg = ask(&down, 2, "example.com.", RecordType::AAAA).await;
        assert_eq!(msg.response_code(), ResponseCode::ServFail);

        let msg = ask(&down, 3, "example.com.", RecordType::MX).await;
        assert_eq!(msg.response_code(), ResponseCode::NotImp);

        let msg = ask(&down, 4, ".", RecordType::A).await;
        assert_eq!(msg.response_code(), ResponseCode::FormErr);

        assert!(handle_query(&down, &[1, 2, 3]).await.is_err());
    }

    #[tokio::test]
    async fn udp_worker_answers_queries() {
        let engine = engine(vec![Reply::Answer(a_response("example.com", &[("192.0.2.1", 60)]))]);
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.expect("bind"));
        let addr = server.local_addr().expect("addr");
        let worker = tokio::spawn(run_udp_worker(0, server, engine));

        let client = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        client
            .send_to(&query(7, "example.com.", RecordType::A), addr)
            .await
            .expect("send");
        let mut buf = [0u8; 512];
        let (len, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .expect("timed out")
            .expect("recv");
        let msg = decode(&buf[..len]);
        assert_eq!(msg.id(), 7);
        assert_eq!(msg.answers().len(), 1);
        worker.abort();
    }

    #[tokio::test]
    async fn tcp_connection_serves_framed_queries() {
        let engine = engine(vec![Reply::Answer(a_response("example.com", &[("192.0.2.1", 60)]))]);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(run_tcp(listener, engine));

        let mut stream = TcpStream::connect(addr).await.expect("connect");
        for id in [11u16, 12] {
            let q = query(id, "example.com.", RecordType::A);
            stream.write_all(&(q.len() as u16).to_be_bytes()).await.expect("write");
            stream.write_all(&q).await.expect("write");

            let mut len_buf = [0u8; 2];
            timeout(Duration::from_secs(2), stream.read_exact(&mut len_buf))
                .await
                .expect("timed out")
                .expect("read");
            let mut body = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut body).await.expect("read");
            let msg = decode(&body);
            assert_eq!(msg.id(), id);
            assert_eq!(msg.answers().len(), 1);
        }
        server.abort();
    }
}
