use std::{num::NonZeroU32, path::Path, time::Duration};

use tokio_util::sync::CancellationToken;
use tsumugi::{decrypt::HlsKey, ParallelDownloader, SegmentStatus, TsumugiError};
use url::Url;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use crate::{encrypt, init_test_tracing, playlist, segment_data, HlsMock, KEY};

const KEY_LINE: &str = r#"#EXT-X-KEY:METHOD=AES-128,URI="/keys/key.bin""#;

/// Serve `count` encrypted segments at `/hls/{i}.ts` whose IV is derived from `media_sequence`.
async fn setup_server(count: usize, media_sequence: u64) -> (MockServer, Url, String) {
    init_test_tracing();
    let server = MockServer::start().await;
    server.mock_bytes("/keys/key.bin", KEY.to_vec()).await;
    for i in 0..count {
        let iv = (media_sequence as u128 + i as u128).to_be_bytes();
        server
            .mock_bytes(&format!("/hls/{i}.ts"), encrypt(&segment_data(i), &iv))
            .await;
    }

    let names: Vec<String> = (0..count).map(|i| format!("{i}.ts")).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let text = playlist(media_sequence, Some(KEY_LINE), &names);
    let url = format!("{}/hls/index.m3u8", server.uri()).parse().unwrap();
    (server, url, text)
}

fn expected_output(indices: &[usize]) -> Vec<u8> {
    indices.iter().flat_map(|&i| segment_data(i)).collect()
}

fn is_empty_dir(path: &Path) -> bool {
    !path.exists() || std::fs::read_dir(path).unwrap().next().is_none()
}

#[tokio::test]
async fn test_download_and_merge() -> anyhow::Result<()> {
    let (_server, url, text) = setup_server(3, 5).await;
    let dir = tempfile::tempdir()?;
    let output = dir.path().join("output.ts");
    let temp_dir = dir.path().join("segments");

    let report = ParallelDownloader::builder()
        .concurrency(NonZeroU32::new(2).unwrap())
        .output(&output)
        .temp_dir(&temp_dir)
        .download(&text, &url)
        .await?;

    assert!(report.is_complete());
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(report.output.as_deref(), Some(output.as_path()));
    assert!(report.skipped_indices.is_empty());
    assert_eq!(std::fs::read(&output)?, expected_output(&[0, 1, 2]));

    let sequences: Vec<u64> = report.segments.iter().map(|s| s.sequence_number).collect();
    assert_eq!(sequences, vec![5, 6, 7]);
    assert!(report
        .segments
        .iter()
        .all(|s| s.status == SegmentStatus::Decrypted));

    // segment files are removed after merging, and so is the directory we created
    assert!(!temp_dir.exists());

    Ok(())
}

#[tokio::test]
async fn test_partial_failure_leaves_gap() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    server.mock_bytes("/keys/key.bin", KEY.to_vec()).await;
    for i in [0usize, 1, 3, 4] {
        server
            .mock_bytes(
                &format!("/hls/{i}.ts"),
                encrypt(&segment_data(i), &(i as u128).to_be_bytes()),
            )
            .await;
    }
    server
        .mock_response("/hls/2.ts", ResponseTemplate::new(404))
        .await;

    let text = playlist(0, Some(KEY_LINE), &["0.ts", "1.ts", "2.ts", "3.ts", "4.ts"]);
    let url: Url = format!("{}/hls/index.m3u8", server.uri()).parse()?;
    let dir = tempfile::tempdir()?;
    let output = dir.path().join("output.ts");
    let temp_dir = dir.path().join("segments");

    let report = ParallelDownloader::builder()
        .retries(1)
        .output(&output)
        .temp_dir(&temp_dir)
        .download(&text, &url)
        .await?;

    assert!(!report.is_complete());
    assert_eq!(report.succeeded, 4);
    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped_indices, vec![2]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].index, 2);
    assert!(report.failures[0].url.ends_with("/hls/2.ts"));
    assert!(report.failures[0].reason.contains("404"));
    assert_eq!(report.segments[2].status, SegmentStatus::Failed);
    assert_eq!(report.segments[2].local_path, None);
    assert_eq!(std::fs::read(&output)?, expected_output(&[0, 1, 3, 4]));
    assert!(is_empty_dir(&temp_dir));

    Ok(())
}

#[tokio::test]
async fn test_bad_ciphertext_fails_only_that_segment() -> anyhow::Result<()> {
    let (server, url, _) = setup_server(3, 0).await;
    server.mock_bytes("/hls/bad.ts", vec![0u8; 33]).await;
    let text = playlist(0, Some(KEY_LINE), &["0.ts", "bad.ts", "2.ts"]);

    let dir = tempfile::tempdir()?;
    let output = dir.path().join("output.ts");
    let report = ParallelDownloader::builder()
        .retries(0)
        .output(&output)
        .temp_dir(dir.path().join("segments"))
        .download(&text, &url)
        .await?;

    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped_indices, vec![1]);
    assert!(report.failures[0].reason.contains("not a multiple of 16"));
    // segment 2 keeps the IV derived from its own position
    let mut expected = segment_data(0);
    expected.extend(segment_data(2));
    assert_eq!(std::fs::read(&output)?, expected);

    Ok(())
}

#[tokio::test]
async fn test_out_of_order_completion_keeps_manifest_order() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    server.mock_bytes("/keys/key.bin", KEY.to_vec()).await;
    for i in 0..4usize {
        // earlier segments finish later
        let delay = Duration::from_millis(300 - i as u64 * 100);
        let body = encrypt(&segment_data(i), &(i as u128).to_be_bytes());
        server
            .mock_response(
                &format!("/hls/{i}.ts"),
                ResponseTemplate::new(200)
                    .set_body_bytes(body)
                    .set_delay(delay),
            )
            .await;
    }
    let text = playlist(0, Some(KEY_LINE), &["0.ts", "1.ts", "2.ts", "3.ts"]);
    let url: Url = format!("{}/hls/index.m3u8", server.uri()).parse()?;

    let dir = tempfile::tempdir()?;
    let output = dir.path().join("output.ts");
    let report = ParallelDownloader::builder()
        .concurrency(NonZeroU32::new(4).unwrap())
        .output(&output)
        .temp_dir(dir.path().join("segments"))
        .download(&text, &url)
        .await?;

    assert_eq!(report.succeeded, 4);
    assert_eq!(std::fs::read(&output)?, expected_output(&[0, 1, 2, 3]));

    Ok(())
}

#[tokio::test]
async fn test_retry_recovers_segment() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/hls/0.ts"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    server.mock_bytes("/keys/key.bin", KEY.to_vec()).await;
    server
        .mock_bytes("/hls/0.ts", encrypt(&segment_data(0), &0u128.to_be_bytes()))
        .await;
    let text = playlist(0, Some(KEY_LINE), &["0.ts"]);
    let url: Url = format!("{}/hls/index.m3u8", server.uri()).parse()?;

    let dir = tempfile::tempdir()?;
    let output = dir.path().join("output.ts");
    let report = ParallelDownloader::builder()
        .retries(2)
        .output(&output)
        .temp_dir(dir.path().join("segments"))
        .download(&text, &url)
        .await?;

    assert_eq!(report.succeeded, 1);
    assert_eq!(std::fs::read(&output)?, segment_data(0));

    Ok(())
}

#[tokio::test]
async fn test_segment_timeout_is_a_fetch_failure() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    server.mock_bytes("/keys/key.bin", KEY.to_vec()).await;
    server
        .mock_response(
            "/hls/0.ts",
            ResponseTemplate::new(200)
                .set_body_bytes(encrypt(&segment_data(0), &0u128.to_be_bytes()))
                .set_delay(Duration::from_secs(3)),
        )
        .await;
    server
        .mock_bytes("/hls/1.ts", encrypt(&segment_data(1), &1u128.to_be_bytes()))
        .await;
    let text = playlist(0, Some(KEY_LINE), &["0.ts", "1.ts"]);
    let url: Url = format!("{}/hls/index.m3u8", server.uri()).parse()?;

    let dir = tempfile::tempdir()?;
    let output = dir.path().join("output.ts");
    let report = ParallelDownloader::builder()
        .retries(0)
        .timeout(Duration::from_millis(200))
        .output(&output)
        .temp_dir(dir.path().join("segments"))
        .download(&text, &url)
        .await?;

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.skipped_indices, vec![0]);
    assert!(report.failures[0].reason.contains("timed out"));
    assert_eq!(std::fs::read(&output)?, segment_data(1));

    Ok(())
}

#[tokio::test]
async fn test_key_fetch_failure_is_fatal() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    server
        .mock_response("/keys/key.bin", ResponseTemplate::new(403))
        .await;
    Mock::given(method("GET"))
        .and(path("/hls/0.ts"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    let text = playlist(0, Some(KEY_LINE), &["0.ts"]);
    let url: Url = format!("{}/hls/index.m3u8", server.uri()).parse()?;

    let dir = tempfile::tempdir()?;
    let output = dir.path().join("output.ts");
    let downloader = ParallelDownloader::builder()
        .output(&output)
        .temp_dir(dir.path().join("segments"))
        .build();
    let token = downloader.cancellation_token();

    let result = downloader.download(&text, &url).await;
    assert!(matches!(result, Err(TsumugiError::KeyFetch { .. })));
    assert!(token.is_cancelled());
    assert!(!output.exists());

    Ok(())
}

#[tokio::test]
async fn test_invalid_key_length_is_fatal() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    server.mock_bytes("/keys/key.bin", vec![1, 2, 3]).await;
    let text = playlist(0, Some(KEY_LINE), &["0.ts"]);
    let url: Url = format!("{}/hls/index.m3u8", server.uri()).parse()?;

    let dir = tempfile::tempdir()?;
    let result = ParallelDownloader::builder()
        .output(dir.path().join("output.ts"))
        .temp_dir(dir.path().join("segments"))
        .download(&text, &url)
        .await;
    assert!(matches!(result, Err(TsumugiError::KeyFetch { .. })));

    Ok(())
}

#[tokio::test]
async fn test_parse_error_before_network() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let result = ParallelDownloader::builder()
        .output(dir.path().join("output.ts"))
        .temp_dir(dir.path().join("segments"))
        .download(
            "#EXTM3U\n#EXT-X-KEY:METHOD=AES-128\n0.ts\n",
            &"http://127.0.0.1:9/index.m3u8".parse()?,
        )
        .await;
    assert!(matches!(result, Err(TsumugiError::Parse(_))));
    assert!(!dir.path().join("segments").exists());

    Ok(())
}

#[tokio::test]
async fn test_manual_key_skips_key_fetch() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/keys/key.bin"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;
    server
        .mock_bytes("/hls/0.ts", encrypt(&segment_data(0), &9u128.to_be_bytes()))
        .await;
    let text = playlist(9, Some(KEY_LINE), &["0.ts"]);
    let url: Url = format!("{}/hls/index.m3u8", server.uri()).parse()?;

    let dir = tempfile::tempdir()?;
    let output = dir.path().join("output.ts");
    let report = ParallelDownloader::builder()
        .key(HlsKey::new(KEY))
        .output(&output)
        .temp_dir(dir.path().join("segments"))
        .download(&text, &url)
        .await?;

    assert_eq!(report.succeeded, 1);
    assert_eq!(std::fs::read(&output)?, segment_data(0));

    Ok(())
}

#[tokio::test]
async fn test_unencrypted_playlist() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    server.mock_bytes("/hls/0.ts", segment_data(0)).await;
    server.mock_bytes("/hls/1.ts", segment_data(1)).await;
    let text = playlist(0, None, &["0.ts", "1.ts"]);
    let url: Url = format!("{}/hls/index.m3u8", server.uri()).parse()?;

    let dir = tempfile::tempdir()?;
    let output = dir.path().join("output.ts");
    let report = ParallelDownloader::builder()
        .output(&output)
        .temp_dir(dir.path().join("segments"))
        .download(&text, &url)
        .await?;

    assert_eq!(report.succeeded, 2);
    assert_eq!(std::fs::read(&output)?, expected_output(&[0, 1]));

    Ok(())
}

#[tokio::test]
async fn test_rerun_is_byte_identical() -> anyhow::Result<()> {
    let (_server, url, text) = setup_server(4, 12).await;
    let dir = tempfile::tempdir()?;

    let mut outputs = Vec::new();
    for _ in 0..2 {
        // same output path twice, the second run must not append to the first
        let output = dir.path().join("output.ts");
        ParallelDownloader::builder()
            .output(&output)
            .temp_dir(dir.path().join("segments"))
            .download(&text, &url)
            .await?;
        outputs.push(std::fs::read(&output)?);
    }
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[0], expected_output(&[0, 1, 2, 3]));

    Ok(())
}

#[tokio::test]
async fn test_cancelled_before_dispatch() -> anyhow::Result<()> {
    let (_server, url, text) = setup_server(3, 0).await;
    let token = CancellationToken::new();
    token.cancel();

    let dir = tempfile::tempdir()?;
    let output = dir.path().join("output.ts");
    let report = ParallelDownloader::builder()
        .cancellation(token)
        .output(&output)
        .temp_dir(dir.path().join("segments"))
        .download(&text, &url)
        .await?;

    assert_eq!(report.succeeded, 0);
    assert_eq!(report.failed, 3);
    assert_eq!(report.skipped_indices, vec![0, 1, 2]);
    assert_eq!(report.output, None);
    assert!(report
        .failures
        .iter()
        .all(|f| f.reason == TsumugiError::Cancelled.to_string()));
    assert!(!output.exists());

    Ok(())
}

#[tokio::test]
async fn test_keep_segments() -> anyhow::Result<()> {
    let (_server, url, text) = setup_server(2, 0).await;
    let dir = tempfile::tempdir()?;
    let temp_dir = dir.path().join("segments");

    let report = ParallelDownloader::builder()
        .keep_segments(true)
        .output(dir.path().join("output.ts"))
        .temp_dir(&temp_dir)
        .download(&text, &url)
        .await?;

    for segment in &report.segments {
        let path = segment.local_path.as_ref().unwrap();
        assert!(path.starts_with(&temp_dir));
        assert_eq!(std::fs::read(path)?, segment_data(segment.index));
    }

    Ok(())
}

#[tokio::test]
async fn test_progress_counts_all_segments() -> anyhow::Result<()> {
    let (server, url, _) = setup_server(2, 0).await;
    server
        .mock_response("/hls/missing.ts", ResponseTemplate::new(404))
        .await;
    let text = playlist(0, Some(KEY_LINE), &["0.ts", "missing.ts", "1.ts"]);

    let dir = tempfile::tempdir()?;
    let downloader = ParallelDownloader::builder()
        .retries(0)
        .output(dir.path().join("output.ts"))
        .temp_dir(dir.path().join("segments"))
        .build();
    let progress = downloader.progress();
    downloader.download(&text, &url).await?;

    assert_eq!(progress.total(), 3);
    assert_eq!(progress.completed(), 3);
    assert_eq!(progress.percentage(), 100.);

    Ok(())
}

#[tokio::test]
async fn test_cancel_while_downloading() -> anyhow::Result<()> {
    init_test_tracing();
    let server = MockServer::start().await;
    server.mock_bytes("/keys/key.bin", KEY.to_vec()).await;
    for i in 0..5usize {
        let body = encrypt(&segment_data(i), &(i as u128).to_be_bytes());
        server
            .mock_response(
                &format!("/hls/{i}.ts"),
                ResponseTemplate::new(200)
                    .set_body_bytes(body)
                    .set_delay(Duration::from_millis(500)),
            )
            .await;
    }
    let text = playlist(0, Some(KEY_LINE), &["0.ts", "1.ts", "2.ts", "3.ts", "4.ts"]);
    let url: Url = format!("{}/hls/index.m3u8", server.uri()).parse()?;

    let dir = tempfile::tempdir()?;
    let output = dir.path().join("output.ts");
    let downloader = ParallelDownloader::builder()
        .concurrency(NonZeroU32::MIN)
        .output(&output)
        .temp_dir(dir.path().join("segments"))
        .build();
    let progress = downloader.progress();
    let token = downloader.cancellation_token();

    // cancel while the second segment is being fetched
    tokio::spawn(async move {
        while progress.completed() < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
    });

    let report = downloader.download(&text, &url).await?;

    // the running segment finishes, nothing new is dispatched
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 3);
    assert_eq!(report.segments[0].status, SegmentStatus::Decrypted);
    assert_eq!(report.segments[1].status, SegmentStatus::Decrypted);
    assert_eq!(
        report.failures.iter().map(|f| f.index).collect::<Vec<_>>(),
        vec![2, 3, 4]
    );
    assert!(report
        .failures
        .iter()
        .all(|f| f.reason == TsumugiError::Cancelled.to_string()));
    assert_eq!(report.skipped_indices, vec![2, 3, 4]);
    assert_eq!(std::fs::read(&output)?, expected_output(&[0, 1]));

    let requests = server.received_requests().await.unwrap_or_default();
    assert!(!requests.iter().any(|r| r.url.path() == "/hls/2.ts"));

    Ok(())
}

#[tokio::test]
async fn test_unwritable_segment_dir_leaves_no_file() -> anyhow::Result<()> {
    let (_server, url, text) = setup_server(3, 0).await;
    let dir = tempfile::tempdir()?;
    let output = dir.path().join("output.ts");
    // a regular file where the segment directory should be
    let temp_dir = dir.path().join("segments");
    std::fs::write(&temp_dir, b"not a directory")?;

    let report = ParallelDownloader::builder()
        .retries(0)
        .output(&output)
        .temp_dir(&temp_dir)
        .download(&text, &url)
        .await?;

    assert_eq!(report.succeeded, 0);
    assert_eq!(report.failed, 3);
    assert_eq!(report.output, None);
    assert!(report.segments.iter().all(|s| s.local_path.is_none()));
    assert!(!output.exists());
    assert_eq!(std::fs::read(&temp_dir)?, b"not a directory");

    Ok(())
}
