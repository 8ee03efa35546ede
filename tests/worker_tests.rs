//! Serving documents over the message transport.


use pdf_resolve::core::worker::{spawn_local_worker, spawn_thread_worker};
use pdf_resolve::core::*;
use test_utils::*;

fn pages() -> Vec<u8> {
    simple_pdf(&["q 1 0 0 1 10 10 cm 0 0 m 50 50 l S Q", "BT 14 TL ET"])
}

#[tokio::test]
async fn test_local_worker_serves_pages() {
    let handler = spawn_local_worker();
    let doc = WorkerDocument::open(handler, OpenParams::new(OpenSource::Data(pages())))
        .await
        .unwrap();

    assert_eq!(doc.page_count(), 2);
    assert_eq!(doc.info().revisions, 1);
    assert!(!doc.info().encrypted);

    let page = doc.get_page(1).await.unwrap();
    assert_eq!(page.index, 1);
    assert_eq!(page.media_box, [0.0, 0.0, 612.0, 792.0]);
    assert_eq!(page.content_streams, 1);

    let remote = doc.get_operator_list(0).await.unwrap();
    let local = open(pages()).await.unwrap().operator_list(0).await.unwrap();
    assert_eq!(remote, *local);

    doc.terminate().await.unwrap();
}

#[tokio::test]
async fn test_errors_reach_the_client() {
    let handler = spawn_local_worker();

    // nothing is open yet
    let err = handler
        .send_with_reply("get_page", serde_json::json!({ "index": 0 }))
        .await
        .unwrap_err();
    assert!(matches!(err, PDFError::MissingDocument(_)), "got {:?}", err);

    let encrypted = PdfBuilder::new()
        .with_pages(&["q Q"])
        .encrypt_rc4("user", "owner")
        .build("/Root 1 0 R");
    let result = WorkerDocument::open(
        handler.clone(),
        OpenParams::new(OpenSource::Data(encrypted.clone())),
    )
    .await;
    assert!(matches!(result, Err(PDFError::PasswordRequired)));

    let params = OpenParams {
        password: Some("user".to_string()),
        ..OpenParams::new(OpenSource::Data(encrypted))
    };
    let doc = WorkerDocument::open(handler, params).await.unwrap();
    assert!(doc.info().encrypted);
    assert!(doc.get_page(5).await.is_err());
    assert_eq!(doc.get_operator_list(0).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_open_forwards_progress() {
    let data = pages();
    let total = data.len();
    let params = OpenParams {
        chunk_size: Some(64),
        ..OpenParams::new(OpenSource::Data(data))
    };

    let mut seen = Vec::new();
    let doc = WorkerDocument::open_with_progress(spawn_local_worker(), params, |progress| {
        seen.push(progress)
    })
    .await
    .unwrap();

    assert_eq!(doc.page_count(), 2);
    assert!(!seen.is_empty());
    assert!(seen.iter().all(|p| p.total == Some(total) && p.loaded <= total));
    assert!(seen.windows(2).all(|w| w[0].loaded <= w[1].loaded));
}

#[tokio::test]
async fn test_cancelled_request_leaves_worker_usable() {
    let doc = WorkerDocument::open(spawn_local_worker(), OpenParams::new(OpenSource::Data(pages())))
        .await
        .unwrap();

    let request = doc.request_operator_list(0).unwrap();
    request.cancel("page scrolled away");
    let err = request.response().await.unwrap_err();
    assert!(err.is_cancelled());

    let list = doc.get_operator_list(1).await.unwrap();
    assert_eq!(
        list.ops().collect::<Vec<_>>(),
        vec![OpCode::BeginText, OpCode::SetLeading, OpCode::EndText]
    );
}

#[tokio::test]
async fn test_open_from_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.pdf");
    std::fs::write(&path, pages()).unwrap();

    let params = OpenParams::new(OpenSource::Path(path.to_string_lossy().into_owned()));
    let doc = WorkerDocument::open(spawn_local_worker(), params).await.unwrap();
    assert_eq!(doc.page_count(), 2);

    let missing = OpenParams::new(OpenSource::Path("/nonexistent/doc.pdf".to_string()));
    assert!(WorkerDocument::open(spawn_local_worker(), missing).await.is_err());
}

#[tokio::test]
async fn test_thread_worker() {
    let worker = spawn_thread_worker().unwrap();
    let doc = WorkerDocument::open(worker.handler.clone(), OpenParams::new(OpenSource::Data(pages())))
        .await
        .unwrap();

    let (first, second) = tokio::join!(doc.get_operator_list(0), doc.get_operator_list(1));
    assert_eq!(first.unwrap().len(), 6);
    assert_eq!(second.unwrap().len(), 3);

    doc.terminate().await.unwrap();
    worker.join().unwrap();
}
