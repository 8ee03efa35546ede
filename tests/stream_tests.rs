//! Stream decoding through the object store: filter chains, predictors,
//! pass-through codecs and the decode cache.


use pdf_resolve::core::*;
use std::sync::Arc;
use test_utils::*;

async fn doc_with(build: impl FnOnce(PdfBuilder) -> PdfBuilder) -> PDFDocument {
    let builder = build(PdfBuilder::new().with_pages(&[""]));
    open(builder.build("/Root 1 0 R")).await.unwrap()
}

async fn bytes(doc: &PDFDocument, num: u32) -> Vec<u8> {
    doc.get_stream_bytes(Ref::new(num, 0)).await.unwrap().to_vec()
}

// ============================================================================
// Filters
// ============================================================================

#[tokio::test]
async fn test_flate() {
    let doc = doc_with(|b| b.flate_stream(10, "", b"compressed content")).await;
    assert_eq!(bytes(&doc, 10).await, b"compressed content");
}

#[tokio::test]
async fn test_ascii_filters() {
    let doc = doc_with(|b| {
        b.stream(10, "/Filter /ASCIIHexDecode", b"48 65 6C 6c 6F>")
            .stream(11, "/Filter /ASCII85Decode", b"87cURD]i,\"Ebo80~>")
            .stream(12, "/Filter /AHx", b"414")
    })
    .await;
    assert_eq!(bytes(&doc, 10).await, b"Hello");
    assert_eq!(bytes(&doc, 11).await, b"Hello World");
    // odd digit count pads with zero
    assert_eq!(bytes(&doc, 12).await, b"A@");
}

#[tokio::test]
async fn test_run_length() {
    let data = [2, b'a', b'b', b'c', 254, b'x', 128];
    let doc = doc_with(|b| b.stream(10, "/Filter /RunLengthDecode", &data)).await;
    assert_eq!(bytes(&doc, 10).await, b"abcxxx");
}

#[tokio::test]
async fn test_lzw_early_change() {
    let text = b"-----A---B--------------A---B-------";
    let early = weezl::encode::Encoder::with_tiff_size_switch(weezl::BitOrder::Msb, 8)
        .encode(text)
        .unwrap();
    let late = weezl::encode::Encoder::new(weezl::BitOrder::Msb, 8)
        .encode(text)
        .unwrap();
    let doc = doc_with(|b| {
        b.stream(10, "/Filter /LZWDecode", &early).stream(
            11,
            "/Filter /LZWDecode /DecodeParms << /EarlyChange 0 >>",
            &late,
        )
    })
    .await;
    assert_eq!(bytes(&doc, 10).await, text);
    assert_eq!(bytes(&doc, 11).await, text);
}

#[tokio::test]
async fn test_filter_chain_applies_in_order() {
    let mut hexed = hex::encode(deflate(b"chained filters")).into_bytes();
    hexed.push(b'>');
    let doc = doc_with(|b| b.stream(10, "/Filter [/ASCIIHexDecode /FlateDecode]", &hexed)).await;
    assert_eq!(bytes(&doc, 10).await, b"chained filters");
}

#[tokio::test]
async fn test_png_predictor() {
    // two rows of three bytes, both with the Up filter
    let rows = [2, 1, 2, 3, 2, 1, 1, 1];
    let doc = doc_with(|b| {
        b.stream(
            10,
            "/Filter /FlateDecode /DecodeParms << /Predictor 12 /Columns 3 >>",
            &deflate(&rows),
        )
    })
    .await;
    assert_eq!(bytes(&doc, 10).await, [1, 2, 3, 2, 3, 4]);
}

#[tokio::test]
async fn test_image_codecs_pass_through() {
    let jpeg = [0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10];
    let doc = doc_with(|b| {
        b.stream(10, "/Filter /DCTDecode /DecodeParms << /ColorTransform 0 >>", &jpeg)
            .stream(11, "/Filter [/AHx /DCT]", b"ffd8>")
    })
    .await;

    let decoded = doc.store().decode_stream(Ref::new(10, 0)).await.unwrap();
    assert_eq!(&decoded.bytes[..], &jpeg);
    assert_eq!(decoded.encoding.as_deref(), Some("DCTDecode"));
    let params = decoded.encoding_params.unwrap();
    assert_eq!(params.get("ColorTransform").and_then(PDFObject::as_number), Some(0.0));

    // filters before the codec still run
    let decoded = doc.store().decode_stream(Ref::new(11, 0)).await.unwrap();
    assert_eq!(&decoded.bytes[..], &[0xff, 0xd8]);
    assert_eq!(decoded.encoding.as_deref(), Some("DCTDecode"));
}

#[tokio::test]
async fn test_unsupported_filter_yields_empty_bytes() {
    let doc = doc_with(|b| b.stream(10, "/Filter /MadeUpDecode", b"data")).await;
    assert!(bytes(&doc, 10).await.is_empty());
    assert!(doc.diagnostics().has(WarningKind::UnsupportedFilter));
}

#[tokio::test]
async fn test_corrupt_flate_yields_empty_bytes() {
    let doc = doc_with(|b| b.stream(10, "/Filter /FlateDecode", b"not zlib at all")).await;
    assert!(bytes(&doc, 10).await.is_empty());
    assert!(doc.diagnostics().has(WarningKind::MalformedObject));
}

#[tokio::test]
async fn test_custom_filter_registration() {
    struct Rot13;

    impl StreamFilter for Rot13 {
        fn name(&self) -> &str {
            "Rot13Decode"
        }

        fn decode(&self, data: &[u8], _params: Option<&Dict>) -> PDFResult<Vec<u8>> {
            Ok(data
                .iter()
                .map(|&c| match c {
                    b'a'..=b'z' => (c - b'a' + 13) % 26 + b'a',
                    _ => c,
                })
                .collect())
        }
    }

    let data = PdfBuilder::new()
        .with_pages(&[""])
        .stream(10, "/Filter /Rot13Decode", b"uryyb")
        .build("/Root 1 0 R");
    let mut registry = FilterRegistry::with_builtins();
    registry.register(Arc::new(Rot13));
    let doc = PDFDocument::open_with_registry(
        Arc::new(MemorySource::new(data)),
        LoadOptions::default(),
        registry,
    )
    .await
    .unwrap();
    assert_eq!(bytes(&doc, 10).await, b"hello");
}

// ============================================================================
// Stream framing
// ============================================================================

#[tokio::test]
async fn test_indirect_and_wrong_lengths() {
    let doc = doc_with(|b| {
        b.object(10, "<< /Length 12 0 R >>\nstream\nindirect\nendstream")
            .object(11, "<< /Length 999 >>\nstream\ntoo long\nendstream")
            .object(12, "8")
    })
    .await;
    assert_eq!(bytes(&doc, 10).await, b"indirect");
    assert_eq!(bytes(&doc, 11).await, b"too long");
}

#[tokio::test]
async fn test_non_stream_yields_empty_bytes() {
    let doc = doc_with(|b| b.object(10, "<< /Type /NotAStream >>")).await;
    assert!(bytes(&doc, 10).await.is_empty());
    assert!(doc.diagnostics().has(WarningKind::MalformedObject));
}

// ============================================================================
// Decode cache
// ============================================================================

#[tokio::test]
async fn test_decoding_is_cached() {
    let doc = doc_with(|b| b.flate_stream(10, "", &vec![b'q'; 4096])).await;

    let first = doc.get_stream_bytes(Ref::new(10, 0)).await.unwrap();
    let hits = doc.stats().cache_hits;
    let second = doc.get_stream_bytes(Ref::new(10, 0)).await.unwrap();

    assert_eq!(first, second);
    // the second call hands out the same buffer
    assert_eq!(first.as_ptr(), second.as_ptr());
    assert_eq!(doc.stats().cache_hits, hits + 1);
}

#[tokio::test]
async fn test_concurrent_decodes_share_one_result() {
    let doc = open_chunked(
        PdfBuilder::new()
            .with_pages(&[""])
            .flate_stream(10, "", &vec![b'w'; 8192])
            .build("/Root 1 0 R"),
        128,
    )
    .await
    .unwrap();

    let (a, b) = tokio::join!(
        doc.get_stream_bytes(Ref::new(10, 0)),
        doc.get_stream_bytes(Ref::new(10, 0))
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.len(), 8192);
    assert_eq!(a.as_ptr(), b.as_ptr());
}
