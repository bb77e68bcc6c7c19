//! Multiplexer integration: many labelled flows over one in-process pipe.
//!
//! Mirrors the classic smoke test: endpoint D dials ten flows to endpoint A;
//! flow `i` announces its number and then repeats it `i` more times; A checks
//! every value and both sides close.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use dccp_over_udp::link::ChanPipe;
use dccp_over_udp::mux::Mux;
use dccp_over_udp::Env;

const FLOWS: u32 = 10;

#[tokio::test(flavor = "multi_thread")]
async fn ten_flows_over_channel_pipe() {
    let env = Env::real();
    let (alink, dlink) = ChanPipe::new();
    let amux = Arc::new(Mux::new(&env, Arc::new(alink)));
    let dmux = Arc::new(Mux::new(&env, Arc::new(dlink)));

    // Accept side: each flow must deliver its number i, then i repetitions.
    let accept_side = {
        let amux = Arc::clone(&amux);
        tokio::spawn(async move {
            let mut readers = Vec::new();
            for _ in 0..FLOWS {
                let flow = amux.accept().await.expect("accept");
                readers.push(tokio::spawn(async move {
                    let first = flow.read().await.expect("read flow number");
                    let i = u32::from_be_bytes(first.try_into().expect("4-byte value"));
                    for j in 0..i {
                        let buf = flow.read().await.expect("read repetition");
                        let got = u32::from_be_bytes(buf.try_into().expect("4-byte value"));
                        assert_eq!(got, i, "flow {i}, repetition {j}");
                    }
                    flow.close();
                    i
                }));
            }
            let mut seen = Vec::new();
            for r in readers {
                seen.push(r.await.expect("reader task"));
            }
            seen.sort_unstable();
            seen
        })
    };

    // Dial side: flow i writes the value i a total of i+1 times.
    let mut dialers = Vec::new();
    for i in 1..=FLOWS {
        let dmux = Arc::clone(&dmux);
        dialers.push(tokio::spawn(async move {
            let flow = dmux.dial(None).expect("dial");
            for _ in 0..=i {
                let n = flow.write(&i.to_be_bytes()).await.expect("write");
                assert_eq!(n, 4);
            }
            flow.close();
        }));
    }
    for d in dialers {
        timeout(Duration::from_secs(5), d)
            .await
            .expect("dialer timed out")
            .expect("dialer task");
    }

    let seen = timeout(Duration::from_secs(5), accept_side)
        .await
        .expect("accept side timed out")
        .expect("accept task");
    assert_eq!(seen, (1..=FLOWS).collect::<Vec<_>>());

    dmux.close();
    amux.close();
}
