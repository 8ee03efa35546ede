//! Document structure tests: page tree, encryption, page compilation and
//! cancellation.


use pdf_resolve::core::*;
use std::sync::Arc;
use test_utils::*;

// ============================================================================
// Page tree
// ============================================================================

#[tokio::test]
async fn test_document_load_basic() {
    let doc = open(simple_pdf(&["0 0 m 10 10 l S", "BT ET"])).await.unwrap();

    assert_eq!(doc.page_count(), 2);
    assert_eq!(doc.catalog().get("Type").and_then(PDFObject::as_name), Some("Catalog"));
    assert!(!doc.is_encrypted());
    assert_eq!(doc.permissions(), None);

    let page = doc.get_page(1).await.unwrap();
    assert_eq!(page.index(), 1);
    assert_eq!(page.reference(), Some(Ref::new(5, 0)));
    assert_eq!(page.media_box(), [0.0, 0.0, 612.0, 792.0]);
    assert_eq!(page.contents(), &[PDFObject::Ref(Ref::new(6, 0))]);
}

#[tokio::test]
async fn test_inherited_attributes() {
    let data = PdfBuilder::new()
        .object(1, "<< /Type /Catalog /Pages 2 0 R >>")
        .object(
            2,
            "<< /Type /Pages /Kids [3 0 R] /Count 3 /Rotate 90 /MediaBox [0 0 300 400] /Resources << /Font << /F1 9 0 R >> >> >>",
        )
        .object(3, "<< /Type /Pages /Parent 2 0 R /Kids [4 0 R 5 0 R 6 0 R] /Count 3 /Rotate 180 >>")
        .object(4, "<< /Type /Page /Parent 3 0 R >>")
        .object(5, "<< /Type /Page /Parent 3 0 R /MediaBox [0 0 100 100] /Rotate -90 >>")
        .object(6, "<< /Type /Page /Parent 3 0 R /CropBox [-50 -50 200 500] /Resources 7 0 R >>")
        .object(7, "<< /Font << /F2 9 0 R >> >>")
        .object(9, "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>")
        .build("/Root 1 0 R");
    let doc = open(data).await.unwrap();
    assert_eq!(doc.page_count(), 3);

    let first = doc.get_page(0).await.unwrap();
    assert_eq!(first.rotate(), 180);
    assert_eq!(first.media_box(), [0.0, 0.0, 300.0, 400.0]);
    assert!(first.resources().and_then(|r| r.get("Font")).is_some());
    assert!(first.contents().is_empty());

    let second = doc.get_page(1).await.unwrap();
    assert_eq!(second.rotate(), 270);
    assert_eq!(second.media_box(), [0.0, 0.0, 100.0, 100.0]);

    let third = doc.get_page(2).await.unwrap();
    // the crop box is clipped to the media box
    assert_eq!(third.crop_box(), [0.0, 0.0, 200.0, 400.0]);
    let fonts = third.resources().and_then(|r| r.get("Font")).unwrap();
    assert!(fonts.as_dict().unwrap().contains_key("F2"));

    let info = third.info();
    assert_eq!(info.index, 2);
    assert_eq!(info.reference, Some(Ref::new(6, 0)));
    assert_eq!(info.rotate, 180);
}

#[tokio::test]
async fn test_missing_count_is_recounted() {
    let data = PdfBuilder::new()
        .object(1, "<< /Type /Catalog /Pages 2 0 R >>")
        .object(2, "<< /Type /Pages /Kids [3 0 R 4 0 R] >>")
        .object(3, "<< /Type /Page >>")
        .object(4, "<< /Type /Page >>")
        .build("/Root 1 0 R");
    let doc = open(data).await.unwrap();
    assert_eq!(doc.page_count(), 2);
    assert!(doc.get_page(1).await.is_ok());
}

#[tokio::test]
async fn test_page_out_of_range() {
    let doc = open(simple_pdf(&[""])).await.unwrap();
    assert!(doc.get_page(1).await.is_err());
    assert!(doc.operator_list(7).await.is_err());
}

#[tokio::test]
async fn test_cyclic_page_tree_does_not_hang() {
    let data = PdfBuilder::new()
        .object(1, "<< /Type /Catalog /Pages 2 0 R >>")
        .object(2, "<< /Type /Pages /Kids [3 0 R 2 0 R] /Count 5 >>")
        .object(3, "<< /Type /Page >>")
        .build("/Root 1 0 R");
    let doc = open(data).await.unwrap();
    assert!(doc.get_page(0).await.is_ok());
    assert!(doc.get_page(3).await.is_err());
}

#[tokio::test]
async fn test_open_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("two-pages.pdf");
    std::fs::write(&path, simple_pdf(&["q Q", "BT ET"])).unwrap();

    let doc = PDFDocument::open_file(&path, LoadOptions::default().with_chunk_size(128))
        .await
        .unwrap();
    assert_eq!(doc.page_count(), 2);
    let list = doc.operator_list(1).await.unwrap();
    assert_eq!(list.ops().collect::<Vec<_>>(), vec![OpCode::BeginText, OpCode::EndText]);
}

#[tokio::test]
async fn test_open_missing_file() {
    let result = PDFDocument::open_file("/nonexistent/file.pdf", LoadOptions::default()).await;
    assert!(result.is_err());
}

// ============================================================================
// Encryption
// ============================================================================

fn encrypted(user: &str) -> Vec<u8> {
    PdfBuilder::new()
        .with_pages(&["0 0 m 5 5 l S"])
        .text(9, b"secret text")
        .encrypt_rc4(user, "owner")
        .build("/Root 1 0 R")
}

#[tokio::test]
async fn test_rc4_empty_user_password() {
    let doc = open(encrypted("")).await.unwrap();
    assert!(doc.is_encrypted());
    let permissions = doc.permissions().unwrap();
    assert!(permissions.print);
    assert!(permissions.copy);

    let text = doc.fetch(Ref::new(9, 0)).await.unwrap();
    assert_eq!(text.as_bytes(), Some(&b"secret text"[..]));
    let content = doc.get_stream_bytes(Ref::new(4, 0)).await.unwrap();
    assert_eq!(&content[..], b"0 0 m 5 5 l S");
    assert_eq!(doc.operator_list(0).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_rc4_passwords() {
    let result = open(encrypted("user")).await;
    assert!(matches!(result, Err(PDFError::PasswordRequired)));

    let result = PDFDocument::open(encrypted("user"), LoadOptions::default().with_password("nope")).await;
    assert!(matches!(result, Err(PDFError::PasswordIncorrect)));

    for password in ["user", "owner"] {
        let doc = PDFDocument::open(encrypted("user"), LoadOptions::default().with_password(password))
            .await
            .unwrap();
        let text = doc.fetch(Ref::new(9, 0)).await.unwrap();
        assert_eq!(text.as_bytes(), Some(&b"secret text"[..]), "password {}", password);
    }
}

// ============================================================================
// Operator lists
// ============================================================================

#[tokio::test]
async fn test_operator_list_is_cached() {
    let doc = PDFDocument::open(
        simple_pdf(&["0 0 m S", "q Q", "BT ET"]),
        LoadOptions::default().with_page_cache_size(2),
    )
    .await
    .unwrap();

    let first = doc.operator_list(0).await.unwrap();
    let again = doc.operator_list(0).await.unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(doc.cached_pages(), 1);

    doc.operator_list(1).await.unwrap();
    doc.operator_list(2).await.unwrap();
    // the least recently used page was evicted
    assert_eq!(doc.cached_pages(), 2);
    let recompiled = doc.operator_list(0).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &recompiled));
    assert_eq!(*first, *recompiled);
}

#[tokio::test]
async fn test_concurrent_compiles_share_one_list() {
    let doc = open_chunked(simple_pdf(&["1 0 0 RG 0 0 m 100 100 l S"]), 64).await.unwrap();
    let (a, b) = tokio::join!(doc.operator_list(0), doc.operator_list(0));
    assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
}

#[tokio::test]
async fn test_multiple_content_streams_are_joined() {
    let data = PdfBuilder::new()
        .object(1, "<< /Type /Catalog /Pages 2 0 R >>")
        .object(2, "<< /Type /Pages /Kids [3 0 R] /Count 1 >>")
        .object(3, "<< /Type /Page /Contents [4 0 R 5 0 R] >>")
        // an operand split across the two streams is not glued together
        .stream(4, "", b"0 0 m 10")
        .flate_stream(5, "", b"10 l S")
        .build("/Root 1 0 R");
    let doc = open(data).await.unwrap();
    let list = doc.operator_list(0).await.unwrap();
    let ops: Vec<OpCode> = list.ops().collect();
    assert_eq!(ops, vec![OpCode::MoveTo, OpCode::LineTo, OpCode::Stroke]);
}

#[tokio::test]
async fn test_compile_page_task() {
    let doc = open(simple_pdf(&["q 2 w Q"])).await.unwrap();
    let task = doc.compile_page(0);
    assert_eq!(task.page_index(), 0);
    let list = task.wait().await.unwrap();
    assert_eq!(list.len(), 3);
}

#[tokio::test]
async fn test_cancelled_page_task() {
    let doc = open(simple_pdf(&["q Q"])).await.unwrap();
    let task = doc.compile_page(0);
    // the task has not been polled yet on this single-threaded runtime
    task.cancel();
    let err = task.wait().await.unwrap_err();
    assert!(err.is_cancelled());

    // the page is still available to others
    assert_eq!(doc.operator_list(0).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_cancelled_document_rejects_loading() {
    let content = "0 0 m 10 10 l S\n".repeat(200);
    let doc = open_chunked(simple_pdf(&[&content]), 32).await.unwrap();
    doc.cancel("closed by the viewer");
    let err = doc.operator_list(0).await.unwrap_err();
    assert!(err.is_cancelled(), "got {:?}", err);
}
