//! Tagged frames over a live in-memory transport, exercising the codec
//! through `FramedRead`/`FramedWrite` the way both daemon and client use
//! it.

use doit_core::ipc::{ExitResult, Frame, FrameCodec, FrameTag, Request};
use futures::{SinkExt, StreamExt};
use tokio_util::codec::{FramedRead, FramedWrite};

#[tokio::test]
async fn test_framed_round_trip_over_stream() {
    let (near, far) = tokio::io::duplex(8 * 1024);
    let (_unused_read, near_write) = tokio::io::split(near);
    let (far_read, _unused_write) = tokio::io::split(far);
    let mut writer = FramedWrite::new(near_write, FrameCodec::new());
    let mut reader = FramedRead::new(far_read, FrameCodec::new());

    // Larger than the transport buffer, so frames straddle reads.
    let sizes = [0usize, 1, 1024, 100 * 1024];

    let send = async {
        for size in sizes {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            writer
                .send(Frame::new(FrameTag::StdoutData, payload))
                .await
                .unwrap();
        }
        writer
            .send(Frame::new(FrameTag::StdinEof, Vec::new()))
            .await
            .unwrap();
    };

    let recv = async {
        let mut seen = Vec::new();
        loop {
            let frame = reader.next().await.unwrap().unwrap();
            if frame.tag == FrameTag::StdinEof {
                break;
            }
            assert_eq!(frame.tag, FrameTag::StdoutData);
            for (i, byte) in frame.payload.iter().enumerate() {
                assert_eq!(*byte, (i % 251) as u8);
            }
            seen.push(frame.payload.len());
        }
        seen
    };

    let ((), seen) = tokio::join!(send, recv);
    assert_eq!(seen, sizes.to_vec());
}

#[tokio::test]
async fn test_json_payloads_cross_the_transport() {
    let (near, far) = tokio::io::duplex(1024);
    let (_unused_read, near_write) = tokio::io::split(near);
    let (far_read, _unused_write) = tokio::io::split(far);
    let mut writer = FramedWrite::new(near_write, FrameCodec::new());
    let mut reader = FramedRead::new(far_read, FrameCodec::new());

    let request = Request {
        args: vec!["echo".to_string(), "hi".to_string()],
        cwd: "/work".to_string(),
        retry: true,
        ..Request::default()
    };
    let exit = ExitResult {
        code: 1,
        error: "doit: policy: nope".to_string(),
        policy_deny: "deny-make-flags".to_string(),
        ..ExitResult::default()
    };

    writer
        .send(Frame::json(FrameTag::Request, &request).unwrap())
        .await
        .unwrap();
    writer
        .send(Frame::json(FrameTag::Exit, &exit).unwrap())
        .await
        .unwrap();

    let frame = reader.next().await.unwrap().unwrap();
    assert_eq!(frame.parse_json::<Request>().unwrap(), request);
    let frame = reader.next().await.unwrap().unwrap();
    assert_eq!(frame.parse_json::<ExitResult>().unwrap(), exit);
}
