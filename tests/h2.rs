#![deny(rust_2018_idioms)]

mod support;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use tokio_test::task;

use estuary::proto::h2::{
    DataFrame, Frame, HeadersFrame, Http2Connection, PushRequest, Reason, StreamId,
};
use estuary::service::{controller_fn, Controller};
use estuary::ServerConfig;

fn request(stream_id: StreamId, method: Method, path: &str, end_stream: bool) -> Frame {
    Frame::Headers(HeadersFrame {
        stream_id,
        status: None,
        method: Some(method),
        scheme: Some("http".to_owned()),
        authority: Some("test".to_owned()),
        path: Some(path.parse::<Uri>().unwrap()),
        headers: HeaderMap::new(),
        end_stream,
        priority: None,
    })
}

fn data(stream_id: StreamId, payload: &'static [u8], end_stream: bool) -> Frame {
    Frame::Data(DataFrame {
        stream_id,
        data: Bytes::from_static(payload),
        end_stream,
    })
}

fn echo_controller() -> impl Controller<Context = ()> {
    controller_fn(|mut exchange| async move {
        let path = exchange.request().headers().path().to_owned();
        let label = path.trim_start_matches('/').to_uppercase();
        match exchange.request().body() {
            Some(body) => {
                let bytes = body.aggregate().await?;
                exchange.response().body().full(bytes);
            }
            None => exchange.response().body().string(label),
        }
        Ok(())
    })
}

/// Everything sent for one stream, as (is_headers, end_stream) pairs.
fn stream_shape(sent: &[Frame], id: StreamId) -> Vec<(bool, bool)> {
    sent.iter()
        .filter_map(|f| match f {
            Frame::Headers(h) if h.stream_id == id => Some((true, h.end_stream)),
            Frame::Data(d) if d.stream_id == id => Some((false, d.end_stream)),
            _ => None,
        })
        .collect()
}

fn stream_body(sent: &[Frame], id: StreamId) -> Vec<u8> {
    let mut out = Vec::new();
    for frame in sent {
        if let Frame::Data(d) = frame {
            if d.stream_id == id {
                out.extend_from_slice(&d.data);
            }
        }
    }
    out
}

#[tokio::test]
async fn concurrent_streams_with_bodies_both_complete() {
    let (channel, handle) = support::channel();
    let mut conn = task::spawn(Http2Connection::new(
        channel,
        echo_controller(),
        ServerConfig::default(),
    ));

    // interleave two uploads, paced so each chunk is consumed before the
    // next arrives
    handle.send_frame(request(1, Method::POST, "/one", false));
    handle.send_frame(request(3, Method::POST, "/two", false));
    handle.send_frame(data(1, b"fir", false));
    handle.send_frame(data(3, b"sec", false));
    assert!(conn.poll().is_pending());
    handle.send_frame(data(1, b"st", true));
    handle.send_frame(data(3, b"ond", true));
    assert!(conn.poll().is_pending());

    let sent = handle.take_sent();
    assert_eq!(stream_body(&sent, 1), b"first");
    assert_eq!(stream_body(&sent, 3), b"second");
    for id in [1u32, 3] {
        let shape = stream_shape(&sent, id);
        assert!(shape[0].0, "stream {} opens with HEADERS", id);
        assert!(
            shape.last().unwrap().1,
            "stream {} ends with end_stream",
            id
        );
        assert_eq!(
            shape.iter().filter(|s| s.1).count(),
            1,
            "stream {} ends exactly once",
            id
        );
    }
}

#[tokio::test]
async fn responses_report_status_and_window_credit_returns() {
    let (channel, handle) = support::channel();
    let mut conn = task::spawn(Http2Connection::new(
        channel,
        echo_controller(),
        ServerConfig::default(),
    ));

    handle.send_frame(request(1, Method::POST, "/up", false));
    handle.send_frame(data(1, b"abc", true));
    assert!(conn.poll().is_pending());

    let sent = handle.take_sent();
    let status = sent
        .iter()
        .find_map(|f| match f {
            Frame::Headers(h) => h.status,
            _ => None,
        })
        .unwrap();
    assert_eq!(status, StatusCode::OK);
    // consumed bytes are acknowledged on the connection and the stream
    let updates: Vec<(StreamId, u32)> = sent
        .iter()
        .filter_map(|f| match f {
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => Some((*stream_id, *increment)),
            _ => None,
        })
        .collect();
    assert!(updates.contains(&(0, 3)));
    assert!(updates.contains(&(1, 3)));
}

#[tokio::test]
async fn push_promise_precedes_the_response_and_runs_as_a_stream() {
    let controller = controller_fn(|exchange| async move {
        exchange.push(PushRequest {
            method: Method::GET,
            path: "/style.css".parse::<Uri>().unwrap(),
            headers: HeaderMap::new(),
        })?;
        exchange.response().body().string("page");
        Ok(())
    });
    let (channel, handle) = support::channel();
    let mut conn = task::spawn(Http2Connection::new(
        channel,
        controller,
        ServerConfig::default(),
    ));

    handle.send_frame(request(1, Method::GET, "/page", true));
    assert!(conn.poll().is_pending());

    let sent = handle.take_sent();
    let promise_at = sent
        .iter()
        .position(|f| matches!(f, Frame::PushPromise(p) if p.promised_id == 2))
        .expect("a push promise");
    let response_at = sent
        .iter()
        .position(|f| matches!(f, Frame::Headers(h) if h.stream_id == 1))
        .expect("the response head");
    assert!(promise_at < response_at, "promise before the response head");
    // the promised stream produced its own complete response
    let promised = stream_shape(&sent, 2);
    assert!(!promised.is_empty());
    assert!(promised.last().unwrap().1);
}

#[tokio::test]
async fn goaway_from_peer_drains_then_closes() {
    let (channel, handle) = support::channel();
    let mut conn = task::spawn(Http2Connection::new(
        channel,
        echo_controller(),
        ServerConfig::default(),
    ));

    handle.send_frame(request(1, Method::GET, "/last", true));
    handle.send_frame(Frame::GoAway {
        last_stream_id: 1,
        reason: Reason::NO_ERROR,
    });
    match conn.poll() {
        std::task::Poll::Ready(result) => result.unwrap(),
        std::task::Poll::Pending => panic!("drained, should close"),
    }
    // the in-flight stream still completed
    let sent = handle.take_sent();
    assert_eq!(stream_body(&sent, 1), b"LAST");
    assert_eq!(handle.shutdowns(), 1);
}

#[tokio::test]
async fn reset_stream_suppresses_its_response() {
    let controller = controller_fn(|exchange| async move {
        let _exchange = exchange;
        futures_util::future::pending::<()>().await;
        Ok(())
    });
    let (channel, handle) = support::channel();
    let mut conn = task::spawn(Http2Connection::new(
        channel,
        controller,
        ServerConfig::default(),
    ));

    handle.send_frame(request(1, Method::GET, "/slow", true));
    assert!(conn.poll().is_pending());
    handle.send_frame(Frame::Reset {
        stream_id: 1,
        reason: Reason::CANCEL,
    });
    assert!(conn.poll().is_pending());

    let sent = handle.take_sent();
    assert!(stream_shape(&sent, 1).is_empty(), "no response frames");
    assert_eq!(handle.shutdowns(), 0);
}
