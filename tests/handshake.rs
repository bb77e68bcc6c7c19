//! Connection establishment, data exchange and graceful close, all in
//! virtual time over an in-process pipe.
//!
//! Runs on the synthetic runtime so the handshake timing assertions and the
//! minute-scale TIMEWAIT quiet period cost no wall-clock time.

use std::sync::Arc;

use dccp_over_udp::ccid::{FixedRateSender, NopReceiver};
use dccp_over_udp::link::ChanPipe;
use dccp_over_udp::mux::Mux;
use dccp_over_udp::state::State;
use dccp_over_udp::synthetic::SyntheticRuntime;
use dccp_over_udp::transitions::MSL;
use dccp_over_udp::{Conn, Env, Error, HeaderConn};

const SEC: i64 = 1_000_000_000;
const SERVICE: u32 = 7;

#[tokio::test]
async fn establish_echo_and_close_gracefully() {
    let rt = SyntheticRuntime::start();
    let env = Env::with_runtime(rt.clone());

    let (clink, slink) = ChanPipe::new();
    let cmux = Mux::new(&env, Arc::new(clink));
    let smux = Mux::new(&env, Arc::new(slink));

    // Client: connect, send, verify the echo.
    let flow = cmux.dial(None).expect("dial");
    let conn = Conn::client(
        &env,
        HeaderConn::new(flow),
        Arc::new(FixedRateSender::new(env.clone(), 100)),
        Arc::new(NopReceiver),
        SERVICE,
    );

    // Server: accept, echo one datagram, then observe the peer's close.
    // The mux stays owned by the test so the link outlives the scenario.
    let accepted = smux.accept().await.expect("accept");
    let server = {
        let env = env.clone();
        tokio::spawn(async move {
            let conn = Conn::server(
                &env,
                HeaderConn::new(accepted),
                Arc::new(FixedRateSender::new(env.clone(), 100)),
                Arc::new(NopReceiver),
            );
            let payload = conn.read_segment().await.expect("server read");
            conn.write_segment(payload).await.expect("server echo");
            let end = conn.read_segment().await.expect_err("peer should close");
            (conn, end)
        })
    };

    conn.write_segment(b"hello datagram".to_vec())
        .await
        .expect("client write");
    let echo = conn.read_segment().await.expect("client read");
    assert_eq!(echo, b"hello datagram");
    assert_eq!(conn.state(), State::Open);
    assert!(
        env.now() < 200_000_000,
        "establishment and echo took {}ns of virtual time",
        env.now()
    );

    // Graceful local close: EOF on both sides, Closing on ours.
    conn.close().expect("close");
    assert_eq!(conn.state(), State::Closing);
    assert_eq!(
        conn.read_segment().await.expect_err("closed for reading"),
        Error::Eof
    );

    let (server_conn, server_end) = server.await.expect("server task");
    assert_eq!(server_end, Error::Eof);

    // The peer's Reset moves us to TIMEWAIT; half an MSL later both
    // connections are gone.
    env.sleep(SEC).await;
    assert_eq!(conn.state(), State::TimeWait);
    env.sleep(MSL / 2 + SEC).await;
    assert_eq!(conn.state(), State::Closed);
    assert_eq!(server_conn.state(), State::Closed);
    assert_eq!(conn.error(), Some(Error::Eof));
    assert_eq!(server_conn.error(), Some(Error::Eof));
}
