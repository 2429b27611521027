//! Integration tests for the HTTP API.
//!
//! Each test spins up an Axum server on a random port backed by the real
//! scheduler, workers and handlers. The external media tools are replaced by
//! small shell scripts so whole job lifecycles run without network access.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use ytdlstem::api::{AppState, router};
use ytdlstem::config::{Config, ToolPaths};
use ytdlstem::handlers::{HandlerRegistry, register_builtin_handlers};
use ytdlstem::media::MediaTools;
use ytdlstem::worker::{JobRegistry, Scheduler};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Fails searches and audio extraction; otherwise writes the media file named by `--output` and prints its info JSON.
const FAKE_YTDLP: &str = r#"
case "$*" in *ytsearch*) echo "ERROR: search unavailable" >&2; exit 1;; esac
case "$*" in *--extract-audio*) echo "ERROR: audio unavailable" >&2; exit 1;; esac
prev=""; tmpl=""
for a in "$@"; do
  if [ "$prev" = "--output" ]; then tmpl="$a"; fi
  prev="$a"
done
f=$(printf '%s' "$tmpl" | sed 's/%(title)s/Test Song/; s/%(ext)s/mp4/')
printf '[download]  50.0%% of 1.00MiB\n'
echo video-bytes > "$f"
printf '{"title": "Test Song", "uploader": "Tester", "duration": 1.5}\n'
"#;

/// Creates `<out>/htdemucs/<input stem>/` with one mp3 per stem, honouring `--two-stems`.
const FAKE_DEMUCS: &str = r#"
prev=""; out=""; two=""
for a in "$@"; do
  if [ "$prev" = "--out" ]; then out="$a"; fi
  if [ "$prev" = "--two-stems" ]; then two=1; fi
  prev="$a"
done
name=$(basename "$prev"); name="${name%.*}"
dir="$out/htdemucs/$name"
mkdir -p "$dir"
if [ -n "$two" ]; then stems="vocals no_vocals"; else stems="vocals drums bass other"; fi
for s in $stems; do echo "$s" > "$dir/$s.mp3"; done
"#;

fn fake_tool(dir: &Path, name: &str, body: &str) -> Vec<String> {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    vec!["sh".to_string(), path.to_string_lossy().into_owned()]
}

struct TestServer {
    base: String,
    client: reqwest::Client,
    cancel: CancellationToken,
    _jobs: TempDir,
    _tools: TempDir,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get_json(&self, path: &str) -> (StatusCode, Value) {
        let resp = self.client.get(self.url(path)).send().await.unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap())
    }

    /// Poll a status endpoint until the job reaches a terminal state.
    async fn wait_finished(&self, status_path: &str) -> Value {
        loop {
            let (status, body) = self.get_json(status_path).await;
            assert_eq!(status, StatusCode::OK);
            if body["status"] == "done" || body["status"] == "error" {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start an Axum server on a random port with fake media tools.
async fn start_server() -> TestServer {
    let jobs_dir = TempDir::new().unwrap();
    let tools_dir = TempDir::new().unwrap();

    let tools = ToolPaths {
        ytdlp: fake_tool(tools_dir.path(), "yt-dlp", FAKE_YTDLP),
        spotdl: vec!["/nonexistent/spotdl".to_string()],
        demucs: fake_tool(tools_dir.path(), "demucs", FAKE_DEMUCS),
        ffmpeg: vec!["/nonexistent/ffmpeg".to_string()],
    };
    let config = Config {
        tools: tools.clone(),
        ..Config::default()
    };

    let media = Arc::new(MediaTools::new(&tools));
    let handlers = Arc::new(HandlerRegistry::new());
    register_builtin_handlers(&handlers, &media);
    let jobs = Arc::new(JobRegistry::new(jobs_dir.path()));
    let scheduler = Arc::new(Scheduler::new(jobs, handlers));

    let cancel = CancellationToken::new();
    scheduler.start_workers(2, cancel.clone()).unwrap();

    let app = router(AppState { scheduler, media }, &config);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        base: format!("http://127.0.0.1:{port}/api"),
        client: reqwest::Client::new(),
        cancel,
        _jobs: jobs_dir,
        _tools: tools_dir,
    }
}

fn upload_form(extra: &[(&'static str, &'static str)]) -> Form {
    let mut form = Form::new().part(
        "file",
        Part::bytes(b"fake audio".to_vec()).file_name("My Song.mp3"),
    );
    for &(name, value) in extra {
        form = form.text(name, value);
    }
    form
}

#[tokio::test]
async fn test_health_reports_queue_size() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let (status, body) = server.get_json("/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["queue_size"], 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_download_lifecycle() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let resp = server
            .client
            .post(server.url("/download/start"))
            .json(&json!({ "url": "https://www.youtube.com/watch?v=abc", "type": "video" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = resp.json().await.unwrap();
        let job_id = body["job_id"].as_str().unwrap().to_string();

        let done = server
            .wait_finished(&format!("/download/status/{job_id}"))
            .await;
        assert_eq!(done["status"], "done", "job failed: {done}");
        assert_eq!(done["progress"], 100.0);
        assert_eq!(done["result"]["filename"], "Test Song.mp4");
        assert_eq!(done["result"]["title"], "Test Song");

        let resp = server
            .client
            .get(server.url(&format!("/download/file/{job_id}")))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "video/mp4");
        assert!(
            resp.headers()["content-disposition"]
                .to_str()
                .unwrap()
                .contains("Test Song.mp4")
        );
        assert_eq!(resp.text().await.unwrap(), "video-bytes\n");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_download_start_rejects_plain_text() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let resp = server
            .client
            .post(server.url("/download/start"))
            .json(&json!({ "url": "never gonna give you up" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "Please provide a valid URL");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_unknown_and_malformed_job_ids() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let missing = uuid::Uuid::new_v4();
        let (status, body) = server
            .get_json(&format!("/stems/status/{missing}"))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Job not found");

        let (status, body) = server.get_json("/karaoke/status/not-a-uuid").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid job id");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_search_failure_is_server_error() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let (status, body) = server.get_json("/download/search?q=some%20song").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("search unavailable"));

        let (status, _) = server.get_json("/download/search?q=").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_spotify_formats_are_canned() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let (status, body) = server
            .get_json("/download/formats?url=https://open.spotify.com/track/abc")
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["platform"], "spotify");
        assert_eq!(body["video_formats"], json!([]));
        assert_eq!(body["audio_formats"].as_array().unwrap().len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_stems_upload_and_archive() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let resp = server
            .client
            .post(server.url("/stems/start"))
            .multipart(upload_form(&[("output_format", "mp3")]))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = resp.json().await.unwrap();
        let job_id = body["job_id"].as_str().unwrap().to_string();

        let done = server.wait_finished(&format!("/stems/status/{job_id}")).await;
        assert_eq!(done["status"], "done", "job failed: {done}");
        assert_eq!(done["result"]["stems"]["vocals"], "vocals.mp3");
        assert_eq!(done["result"]["stems"].as_object().unwrap().len(), 4);

        let resp = server
            .client
            .get(server.url(&format!("/stems/download/{job_id}?stem=drums")))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "audio/mpeg");
        assert_eq!(resp.text().await.unwrap(), "drums\n");

        let resp = server
            .client
            .get(server.url(&format!("/stems/download/{job_id}")))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "application/zip");
        let bytes = resp.bytes().await.unwrap();
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes.to_vec())).unwrap();
        assert_eq!(archive.len(), 4);
        let mut bass = String::new();
        archive
            .by_name("bass.mp3")
            .unwrap()
            .read_to_string(&mut bass)
            .unwrap();
        assert_eq!(bass, "bass\n");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_stems_form_validation() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let resp = server
            .client
            .post(server.url("/stems/start"))
            .multipart(Form::new().text("url", "just words"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = server
            .client
            .post(server.url("/stems/start"))
            .multipart(Form::new().text("output_format", "mp3"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "Provide either a file or URL");

        let resp = server
            .client
            .post(server.url("/stems/start"))
            .multipart(upload_form(&[("stems", "kazoo")]))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_karaoke_tracks_and_fallback() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let resp = server
            .client
            .post(server.url("/karaoke/start"))
            .multipart(upload_form(&[]))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = resp.json().await.unwrap();
        let job_id = body["job_id"].as_str().unwrap().to_string();

        let done = server
            .wait_finished(&format!("/karaoke/status/{job_id}"))
            .await;
        assert_eq!(done["status"], "done", "job failed: {done}");
        assert_eq!(done["result"]["tracks"]["instrumental"], "instrumental.mp3");
        assert_eq!(done["result"]["tracks"]["vocals"], "vocals.mp3");

        let vocals = server
            .client
            .get(server.url(&format!("/karaoke/download/{job_id}?track=vocals")))
            .send()
            .await
            .unwrap();
        assert_eq!(vocals.text().await.unwrap(), "vocals\n");

        let fallback = server
            .client
            .get(server.url(&format!("/karaoke/download/{job_id}?track=bogus")))
            .send()
            .await
            .unwrap();
        assert_eq!(fallback.status(), StatusCode::OK);
        assert_eq!(fallback.text().await.unwrap(), "no_vocals\n");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_failed_job_reports_error_and_blocks_download() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        // Remote karaoke input goes through yt-dlp audio extraction, which fails here.
        let resp = server
            .client
            .post(server.url("/karaoke/start"))
            .multipart(Form::new().text("url", "https://soundcloud.com/artist/track"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = resp.json().await.unwrap();
        let job_id = body["job_id"].as_str().unwrap().to_string();

        let finished = server
            .wait_finished(&format!("/karaoke/status/{job_id}"))
            .await;
        assert_eq!(finished["status"], "error");
        assert!(finished["result"].is_null());
        assert!(finished["message"].as_str().unwrap().contains("audio unavailable"));

        let (status, body) = server
            .get_json(&format!("/karaoke/download/{job_id}"))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Job not complete");
    })
    .await
    .expect("test timed out");
}
