//! mockdevice - simulated camera for local development
//!
//! Serves the same two endpoints a real device exposes:
//! - `GET /ping` answers 200 for liveness checks
//! - `GET /stream` serves an endless `multipart/x-mixed-replace` MJPEG body
//!
//! Frames are generated on the fly: a solid background with a stripe that
//! moves a little each frame, so consecutive captures are distinguishable.

use anyhow::{Context, Result};
use clap::Parser;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::{BufRead, BufReader, Cursor, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

const FRAME_WIDTH: u32 = 320;
const FRAME_HEIGHT: u32 = 240;
const MAX_REQUEST_BYTES: u64 = 8 * 1024;

#[derive(Parser, Debug)]
#[command(name = "mockdevice", about = "Simulated MJPEG camera device")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8080", env = "MOCKDEVICE_ADDR")]
    addr: String,

    /// Frames per second served on /stream.
    #[arg(long, default_value_t = 10)]
    fps: u32,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let listener = TcpListener::bind(&args.addr)
        .with_context(|| format!("bind mock device to {}", args.addr))?;
    log::info!("mock device listening on {}", args.addr);

    let frame_interval = Duration::from_millis(1000 / u64::from(args.fps.max(1)));
    for stream in listener.incoming() {
        match stream {
            Ok(client) => {
                std::thread::spawn(move || {
                    if let Err(e) = serve_client(client, frame_interval) {
                        log::debug!("client disconnected: {:#}", e);
                    }
                });
            }
            Err(e) => log::warn!("accept failed: {}", e),
        }
    }
    Ok(())
}

fn serve_client(client: TcpStream, frame_interval: Duration) -> Result<()> {
    let mut reader = BufReader::new(client.try_clone().context("clone client socket")?);
    let mut request_line = String::new();
    reader
        .by_ref()
        .take(MAX_REQUEST_BYTES)
        .read_line(&mut request_line)
        .context("read request line")?;

    let path = request_line.split_whitespace().nth(1).unwrap_or("/");
    // Drain the rest of the request headers.
    let mut header = String::new();
    while reader
        .by_ref()
        .take(MAX_REQUEST_BYTES)
        .read_line(&mut header)
        .context("read request header")?
        > 0
    {
        if header == "\r\n" || header == "\n" {
            break;
        }
        header.clear();
    }

    let mut client = client;
    match path {
        "/ping" => {
            client
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\npong")
                .context("write ping response")?;
            Ok(())
        }
        "/stream" => serve_stream(client, frame_interval),
        _ => {
            client
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                .context("write 404")?;
            Ok(())
        }
    }
}

fn serve_stream(mut client: TcpStream, frame_interval: Duration) -> Result<()> {
    client
        .write_all(
            b"HTTP/1.1 200 OK\r\n\
              Content-Type: multipart/x-mixed-replace; boundary=frame\r\n\
              Connection: close\r\n\r\n",
        )
        .context("write stream headers")?;

    let mut counter: u32 = 0;
    loop {
        let jpeg = render_frame(counter)?;
        client
            .write_all(b"\r\n--frame\r\nContent-Type: image/jpeg\r\n\r\n")
            .context("write part header")?;
        client.write_all(&jpeg).context("write frame")?;
        client.flush().context("flush frame")?;
        counter = counter.wrapping_add(1);
        std::thread::sleep(frame_interval);
    }
}

fn render_frame(counter: u32) -> Result<Vec<u8>> {
    let stripe_x = (counter * 7) % FRAME_WIDTH;
    let mut img = RgbImage::from_pixel(FRAME_WIDTH, FRAME_HEIGHT, Rgb([24, 24, 32]));
    for y in 0..FRAME_HEIGHT {
        for dx in 0..12 {
            let x = (stripe_x + dx) % FRAME_WIDTH;
            img.put_pixel(x, y, Rgb([220, 180, 40]));
        }
    }
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
        .context("encode frame")?;
    Ok(bytes)
}
