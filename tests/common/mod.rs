#![allow(dead_code)]

use badge_processor::acquisition::{AcquisitionCoordinator, HttpFetcher, LocalInventory};
use badge_processor::badge::face_detection::NoFaceLocator;
use badge_processor::badge::{BadgeSpec, Compositor, FieldPosition, QR_FIELD};
use badge_processor::batch::BatchOrchestrator;
use badge_processor::roster::ImageFormat;
use image::{Rgba, RgbaImage};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

/// Minimal HTTP/1.1 server answering GETs from a fixed route table
pub struct MockServer {
    pub base_url: String,
    requests: Arc<Mutex<Vec<String>>>,
    hits: Arc<AtomicUsize>,
}

impl MockServer {
    /// Unknown paths answer 404
    pub fn start(routes: HashMap<String, (u16, Vec<u8>)>) -> Self {
        Self::start_with_delays(routes, HashMap::new())
    }

    /// Like `start`, but paths in `delays` stall before answering
    pub fn start_with_delays(
        routes: HashMap<String, (u16, Vec<u8>)>,
        delays: HashMap<String, Duration>,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let addr = listener.local_addr().expect("mock server address");
        let routes = Arc::new((routes, delays));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let hits = Arc::new(AtomicUsize::new(0));

        let (r, q, h) = (routes.clone(), requests.clone(), hits.clone());
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let (r, q, h) = (r.clone(), q.clone(), h.clone());
                thread::spawn(move || handle(stream, &r, &q, &h));
            }
        });

        Self {
            base_url: format!("http://{}/img", addr),
            requests,
            hits,
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn requested_paths(&self) -> Vec<String> {
        self.requests.lock().expect("request log").clone()
    }
}

type RouteTable = (HashMap<String, (u16, Vec<u8>)>, HashMap<String, Duration>);

fn handle(
    stream: TcpStream,
    (routes, delays): &RouteTable,
    requests: &Mutex<Vec<String>>,
    hits: &AtomicUsize,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).is_err() {
        return;
    }
    // Drain headers
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) if line == "\r\n" || line == "\n" => break,
            Ok(_) => {}
        }
    }

    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();
    hits.fetch_add(1, Ordering::SeqCst);
    requests.lock().expect("request log").push(path.clone());

    if let Some(delay) = delays.get(&path) {
        thread::sleep(*delay);
    }

    let (status, body) = routes
        .get(&path)
        .cloned()
        .unwrap_or((404, b"not found".to_vec()));
    let reason = match status {
        200 => "OK",
        403 => "Forbidden",
        404 => "Not Found",
        _ => "Error",
    };

    let mut stream = reader.into_inner();
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n",
        status,
        reason,
        body.len()
    );
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

/// Encoded PNG portrait: grey background with a darker centre block
pub fn portrait_png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_fn(width, height, |x, y| {
        let inside = x > width / 4 && x < width * 3 / 4 && y > height / 4 && y < height * 3 / 4;
        if inside {
            Rgba([90, 60, 40, 255])
        } else {
            Rgba([200, 200, 200, 255])
        }
    });
    let mut bytes = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .expect("encode portrait");
    bytes
}

/// Scratch directories plus a plain template with a portrait slot and QR box
pub struct BadgeEnv {
    _tmp: TempDir,
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
    pub template: PathBuf,
}

impl BadgeEnv {
    pub fn new() -> Self {
        let tmp = TempDir::new().expect("create temp dir");
        let source_dir = tmp.path().join("photos");
        let output_dir = tmp.path().join("badges");
        std::fs::create_dir_all(&source_dir).expect("create source dir");

        let template = tmp.path().join("template.png");
        RgbaImage::from_pixel(300, 450, Rgba([20, 60, 160, 255]))
            .save(&template)
            .expect("write template");

        Self {
            _tmp: tmp,
            source_dir,
            output_dir,
            template,
        }
    }

    pub fn spec(&self) -> BadgeSpec {
        let mut spec = BadgeSpec::new(
            &self.template,
            FieldPosition {
                x: 75,
                y: 40,
                width: 150,
                height: 200,
                ..Default::default()
            },
        );
        spec.position_map.insert(
            QR_FIELD.to_string(),
            FieldPosition {
                x: 100,
                y: 300,
                width: 100,
                height: 100,
                ..Default::default()
            },
        );
        spec
    }

    pub fn place_source(&self, filename: &str, bytes: &[u8]) -> PathBuf {
        let path = self.source_dir.join(filename);
        std::fs::write(&path, bytes).expect("write source image");
        path
    }

    pub fn inventory(&self) -> LocalInventory {
        LocalInventory::new(&self.source_dir)
    }

    pub fn orchestrator(&self, base_url: &str) -> BatchOrchestrator<HttpFetcher> {
        self.orchestrator_with_timeout(base_url, Duration::from_secs(5))
    }

    pub fn orchestrator_with_timeout(
        &self,
        base_url: &str,
        timeout: Duration,
    ) -> BatchOrchestrator<HttpFetcher> {
        let fetcher = HttpFetcher::new(base_url, ImageFormat::Png).expect("http fetcher");
        let coordinator = AcquisitionCoordinator::new(self.inventory(), fetcher)
            .with_workers(3)
            .with_timeout(timeout);
        let compositor = Compositor::new(Arc::new(NoFaceLocator), &self.output_dir);
        BatchOrchestrator::new(coordinator, compositor, ImageFormat::Png)
    }

    pub fn source_exists(&self, filename: &str) -> bool {
        self.source_dir.join(filename).is_file()
    }

    pub fn output_files(&self) -> Vec<PathBuf> {
        list_files(&self.output_dir)
    }
}

fn list_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map(|entries| entries.flatten().map(|e| e.path()).collect())
        .unwrap_or_default();
    files.sort();
    files
}
