//! End-to-end capture tests against a local MJPEG endpoint.

use std::io::{BufRead, BufReader, Cursor, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

use device_capture::{
    CancelToken, CaptureSession, CollectingSink, DeviceRecord, HttpStreamSource, SharedSink,
    StreamSettings, StreamSource,
};

fn jpeg_fixture(shade: u8) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 16, Rgb([shade, shade, shade])));
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
        .expect("encode fixture");
    bytes
}

fn read_request(client: &TcpStream) {
    let mut reader = BufReader::new(client.try_clone().expect("clone socket"));
    let mut line = String::new();
    while reader.read_line(&mut line).expect("read request") > 0 {
        if line == "\r\n" || line == "\n" {
            break;
        }
        line.clear();
    }
}

/// Serve one MJPEG response with the given parts, then close.
fn spawn_mjpeg_server(frames: Vec<Vec<u8>>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    std::thread::spawn(move || {
        let (mut client, _) = listener.accept().expect("accept");
        read_request(&client);
        client
            .write_all(
                b"HTTP/1.1 200 OK\r\n\
                  Content-Type: multipart/x-mixed-replace; boundary=frame\r\n\
                  Connection: close\r\n\r\n",
            )
            .expect("write headers");
        for frame in frames {
            client
                .write_all(b"\r\n--frame\r\nContent-Type: image/jpeg\r\n\r\n")
                .expect("write part header");
            client.write_all(&frame).expect("write frame");
            client.flush().expect("flush");
            std::thread::sleep(Duration::from_millis(20));
        }
    });
    format!("http://{}", addr)
}

fn spawn_error_server(status_line: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    std::thread::spawn(move || {
        let (mut client, _) = listener.accept().expect("accept");
        read_request(&client);
        client
            .write_all(format!("{}\r\nContent-Length: 0\r\n\r\n", status_line).as_bytes())
            .expect("write response");
    });
    format!("http://{}", addr)
}

fn device(url: &str) -> DeviceRecord {
    DeviceRecord {
        id: "mockdevice".to_string(),
        name: "Mock Device".to_string(),
        url: url.to_string(),
    }
}

fn shared(sink: &CollectingSink) -> SharedSink {
    Arc::new(Mutex::new(sink.clone()))
}

#[test]
fn captures_mjpeg_frames_end_to_end() {
    // Middle frame carries valid JPEG markers around garbage; it must still
    // flow through the pipeline as an undecodable frame, not be dropped.
    let mut corrupt = vec![0xFF, 0xD8];
    corrupt.extend_from_slice(b"not really image data");
    corrupt.extend_from_slice(&[0xFF, 0xD9]);
    let url = spawn_mjpeg_server(vec![jpeg_fixture(40), corrupt, jpeg_fixture(200)]);

    let source = HttpStreamSource::new(&url, StreamSettings::default());
    let sink = CollectingSink::new();
    let mut session = CaptureSession::new(device(&url), Box::new(source), shared(&sink));

    // The server closes after the last frame; the read error path plus the
    // deadline both terminate the capture.
    let token = CancelToken::with_timeout(Duration::from_secs(3));
    session.start(&token).expect("capture");

    assert_eq!(sink.frame_timestamps().len(), 3);
    assert_eq!(sink.sessions_started(), 1);
    assert_eq!(sink.sessions_ended(), 1);
}

#[test]
fn http_error_fails_connect_but_ends_session() {
    let url = spawn_error_server("HTTP/1.1 503 Service Unavailable");

    let source = HttpStreamSource::new(&url, StreamSettings::default());
    let sink = CollectingSink::new();
    let mut session = CaptureSession::new(device(&url), Box::new(source), shared(&sink));

    let token = CancelToken::with_timeout(Duration::from_secs(3));
    assert!(session.start(&token).is_err());

    assert!(sink.frame_timestamps().is_empty());
    assert_eq!(sink.sessions_started(), 1);
    assert_eq!(sink.sessions_ended(), 1);
}

#[test]
fn snapshot_endpoint_is_polled_per_frame() {
    // A device answering with a plain JPEG body gets polled once per frame.
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    std::thread::spawn(move || {
        for _ in 0..4 {
            let Ok((mut client, _)) = listener.accept() else {
                return;
            };
            read_request(&client);
            let body = jpeg_fixture(90);
            let headers = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                body.len()
            );
            client.write_all(headers.as_bytes()).expect("headers");
            client.write_all(&body).expect("body");
        }
    });
    let url = format!("http://{}", addr);

    let source = HttpStreamSource::new(&url, StreamSettings::default());
    let sink = CollectingSink::new();
    let mut session = CaptureSession::new(device(&url), Box::new(source), shared(&sink));

    let token = CancelToken::with_timeout(Duration::from_millis(500));
    session.start(&token).expect("capture");

    assert!(!sink.frame_timestamps().is_empty());
    assert_eq!(sink.sessions_ended(), 1);
}

#[test]
fn cancellation_unblocks_stalled_connection() {
    // Server sends one frame, then keeps the connection open without any
    // further bytes. Cancellation must still end the session promptly
    // instead of waiting out a network read.
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    std::thread::spawn(move || {
        let (mut client, _) = listener.accept().expect("accept");
        read_request(&client);
        client
            .write_all(
                b"HTTP/1.1 200 OK\r\n\
                  Content-Type: multipart/x-mixed-replace; boundary=frame\r\n\
                  Connection: close\r\n\r\n\
                  \r\n--frame\r\nContent-Type: image/jpeg\r\n\r\n",
            )
            .expect("write headers");
        client.write_all(&jpeg_fixture(70)).expect("write frame");
        client.flush().expect("flush");
        std::thread::sleep(Duration::from_secs(5));
    });
    let url = format!("http://{}", addr);

    let source = HttpStreamSource::new(&url, StreamSettings::default());
    let sink = CollectingSink::new();
    let mut session = CaptureSession::new(device(&url), Box::new(source), shared(&sink));

    let token = CancelToken::new();
    let canceller = token.clone();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        canceller.cancel();
    });

    let begun = Instant::now();
    session.start(&token).expect("capture");
    handle.join().expect("cancel thread");

    assert!(
        begun.elapsed() < Duration::from_millis(600),
        "session held past cancellation: {:?}",
        begun.elapsed()
    );
    assert_eq!(sink.frame_timestamps().len(), 1);
    assert_eq!(sink.sessions_ended(), 1);
}

#[test]
fn oversized_snapshot_is_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    std::thread::spawn(move || {
        // First request decides the mode; answer with a small plain JPEG.
        let (mut client, _) = listener.accept().expect("accept");
        read_request(&client);
        let small = jpeg_fixture(10);
        let _ = client.write_all(
            format!(
                "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                small.len()
            )
            .as_bytes(),
        );
        let _ = client.write_all(&small);

        // The snapshot poll gets a body past any sane frame size.
        let (mut client, _) = listener.accept().expect("accept");
        read_request(&client);
        let oversized = vec![0u8; 5 * 1024 * 1024 + 16];
        let _ = client.write_all(
            format!(
                "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                oversized.len()
            )
            .as_bytes(),
        );
        let _ = client.write_all(&oversized);
    });
    let url = format!("http://{}", addr);

    let mut source = HttpStreamSource::new(&url, StreamSettings::default());
    source.connect().expect("connect");

    let token = CancelToken::with_timeout(Duration::from_millis(400));
    let (tx, rx) = std::sync::mpsc::sync_channel(8);
    source.stream(&token, tx).expect("stream");

    // The truncated body must never surface as a frame.
    assert_eq!(rx.try_iter().count(), 0);
}

#[test]
fn unreachable_device_reports_connect_error() {
    // Port from a listener that was immediately dropped; nothing is there.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr")
    };
    let mut source = HttpStreamSource::new(
        &format!("http://{}", addr),
        StreamSettings {
            connect_timeout: Duration::from_millis(300),
            read_timeout: Duration::from_millis(300),
            ..StreamSettings::default()
        },
    );
    assert!(source.connect().is_err());
}

#[test]
fn rejects_non_http_device_url() {
    let mut source = HttpStreamSource::new("rtsp://camera-1", StreamSettings::default());
    assert!(source.connect().is_err());
}
