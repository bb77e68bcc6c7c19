//! Timer-driven behaviour against unresponsive peers, in virtual time.
//!
//! The peer side of each test speaks raw headers over a multiplexer flow, so
//! the exact packets on the wire can be counted and withheld at will.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dccp_over_udp::ccid::{FixedRateSender, NopReceiver};
use dccp_over_udp::header::{Header, PacketType};
use dccp_over_udp::link::ChanPipe;
use dccp_over_udp::mux::Mux;
use dccp_over_udp::state::State;
use dccp_over_udp::synthetic::SyntheticRuntime;
use dccp_over_udp::transitions::MSL;
use dccp_over_udp::{Conn, Env, Error, HeaderConn};

const SEC: i64 = 1_000_000_000;
const SERVICE: u32 = 7;

fn testbed() -> (Arc<SyntheticRuntime>, Env, Mux, Mux) {
    let rt = SyntheticRuntime::start();
    let env = Env::with_runtime(rt.clone());
    let (clink, slink) = ChanPipe::new();
    let cmux = Mux::new(&env, Arc::new(clink));
    let smux = Mux::new(&env, Arc::new(slink));
    (rt, env, cmux, smux)
}

fn client(env: &Env, cmux: &Mux) -> Arc<Conn> {
    let flow = cmux.dial(None).expect("dial");
    Conn::client(
        env,
        HeaderConn::new(flow),
        Arc::new(FixedRateSender::new(env.clone(), 1000)),
        Arc::new(NopReceiver),
        SERVICE,
    )
}

/// A peer that never answers.  The client must retransmit its Request on the
/// back-off schedule (1 s sleeps, lengthening by 4/3 every 10 s) and abort
/// once 30 s of lifetime are spent: 1 initial + 24 re-sends.
#[tokio::test]
async fn request_times_out_after_backoff() {
    let (_rt, env, cmux, smux) = testbed();

    let requests = Arc::new(AtomicUsize::new(0));
    {
        let requests = Arc::clone(&requests);
        env.go("silent-peer", async move {
            let flow = smux.accept().await.expect("accept");
            let hc = HeaderConn::new(flow);
            while let Ok(h) = hc.read().await {
                if h.ptype == PacketType::Request {
                    requests.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
    }

    let conn = client(&env, &cmux);
    let err = conn.read_segment().await.expect_err("must abort");

    // Let the writer and the counting peer drain their queues; plain yields,
    // since the virtual clock may already be quiescent.
    for _ in 0..200 {
        tokio::task::yield_now().await;
    }

    assert_eq!(err, Error::Abort);
    assert_eq!(conn.state(), State::Closed);
    assert_eq!(conn.error(), Some(Error::Abort));
    let elapsed = env.now();
    assert!(
        (30 * SEC..33 * SEC).contains(&elapsed),
        "aborted at {elapsed}ns"
    );
    assert_eq!(requests.load(Ordering::SeqCst), 25);

    // Teardown is idempotent with respect to CLOSED.
    conn.abort();
    conn.abort_quietly();
    assert_eq!(conn.state(), State::Closed);
    assert_eq!(conn.error(), Some(Error::Abort));
}

/// Establish by hand, then go silent.  The local close must retransmit Close
/// until MSL/4 is spent, enter TIMEWAIT, and reach CLOSED after MSL/2 more.
#[tokio::test]
async fn closing_backs_off_into_timewait_then_closed() {
    let (_rt, env, cmux, smux) = testbed();

    let closes = Arc::new(AtomicUsize::new(0));
    {
        let closes = Arc::clone(&closes);
        env.go("handshake-then-silent-peer", async move {
            let flow = smux.accept().await.expect("accept");
            let hc = HeaderConn::new(flow);

            // Handshake, scripted: Request → Response → Ack → Ack.
            let req = hc.read().await.expect("request");
            assert_eq!(req.ptype, PacketType::Request);
            let mut resp = Header::of_type(PacketType::Response);
            resp.seqno = 1_000;
            resp.ackno = req.seqno;
            resp.service_code = req.service_code;
            hc.write(&resp).await.expect("response");

            let ack = loop {
                let h = hc.read().await.expect("ack");
                if h.ptype == PacketType::Ack {
                    break h;
                }
            };
            let mut open_ack = Header::of_type(PacketType::Ack);
            open_ack.seqno = 1_001;
            open_ack.ackno = ack.seqno;
            hc.write(&open_ack).await.expect("opening ack");

            // Fall silent; only count the peer's Close retransmissions.
            while let Ok(h) = hc.read().await {
                if h.ptype == PacketType::Close {
                    closes.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
    }

    let conn = client(&env, &cmux);
    while conn.state() != State::Open {
        assert!(env.now() < 20 * SEC, "handshake never completed");
        env.sleep(10_000_000).await;
    }
    let opened_at = env.now();

    conn.close().expect("close");
    assert_eq!(conn.state(), State::Closing);
    assert_eq!(conn.error(), Some(Error::Eof));

    // MSL/4 of unanswered Close re-sends...
    env.sleep(MSL / 4 + SEC).await;
    assert_eq!(conn.state(), State::TimeWait);
    assert!(closes.load(Ordering::SeqCst) > 1, "close must be re-sent");

    // ...then the quiet period, then gone.
    env.sleep(MSL / 2 + SEC).await;
    assert_eq!(conn.state(), State::Closed);
    assert_eq!(conn.error(), Some(Error::Eof));
    assert!(
        env.now() - opened_at < MSL,
        "teardown overran: {}ns",
        env.now() - opened_at
    );
}
