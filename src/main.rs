use pdf_resolve::core::xref::SectionKind;
use pdf_resolve::core::{LoadOptions, PDFDocument, PDFObject, PDFResult, Ref, XRefEntry};
use std::env;
use std::path::Path;
use std::process;

struct Options {
    path: String,
    show_xref: bool,
    show_trailer: bool,
    show_pages: bool,
    show_stats: bool,
    show_warnings: bool,
    json: bool,
    object: Option<u32>,
    revision: Option<usize>,
    ops_page: Option<usize>,
    password: Option<String>,
    chunk_size: Option<usize>,
}

fn usage(program: &str) -> ! {
    eprintln!("PDF Structure Inspector");
    eprintln!("Usage: {} <pdf-file> [options]", program);
    eprintln!("\nOptions:");
    eprintln!("  --all              Show xref, trailer, pages and stats (default)");
    eprintln!("  --xref             Show cross-reference sections");
    eprintln!("  --trailer          Show trailer dictionary");
    eprintln!("  --pages            Show page sizes");
    eprintln!("  --object <num>     Show a specific object");
    eprintln!("  --revision <n>     With --object: value as of revision n (0 = original)");
    eprintln!("  --ops <page>       Compile a page and list its operators (1-based)");
    eprintln!("  --json             With --ops: print the operator list as JSON");
    eprintln!("  --stats            Show loading statistics");
    eprintln!("  --warnings         Show recovered problems");
    eprintln!("  --password <pw>    Password for encrypted files");
    eprintln!("  --chunk-size <n>   Range request size in bytes");
    eprintln!("\nSet RUST_LOG=debug for loader logs.");
    process::exit(1);
}

fn parse_args() -> Options {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        usage(&args[0]);
    }

    let value_of = |flag: &str| -> Option<String> {
        let pos = args.iter().position(|arg| arg == flag)?;
        match args.get(pos + 1) {
            Some(value) => Some(value.clone()),
            None => {
                eprintln!("Error: {} requires a value", flag);
                process::exit(1);
            }
        }
    };
    let number_of = |flag: &str| -> Option<usize> {
        value_of(flag).map(|value| {
            value.parse().unwrap_or_else(|_| {
                eprintln!("Error: {} expects a number, got {}", flag, value);
                process::exit(1);
            })
        })
    };
    let has = |flag: &str| args.iter().any(|arg| arg == flag);

    let object = number_of("--object").map(|n| n as u32);
    let ops_page = number_of("--ops");
    let show_all = has("--all")
        || !(has("--xref") || has("--trailer") || has("--pages") || has("--stats") || has("--warnings"))
            && object.is_none()
            && ops_page.is_none();

    Options {
        path: args[1].clone(),
        show_xref: show_all || has("--xref"),
        show_trailer: show_all || has("--trailer"),
        show_pages: show_all || has("--pages"),
        show_stats: show_all || has("--stats"),
        show_warnings: show_all || has("--warnings"),
        json: has("--json"),
        object,
        revision: number_of("--revision"),
        ops_page,
        password: value_of("--password"),
        chunk_size: number_of("--chunk-size"),
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let options = parse_args();

    if !Path::new(&options.path).exists() {
        eprintln!("Error: File not found: {}", options.path);
        process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: cannot start runtime: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(inspect(&options)) {
        eprintln!("Error: {}", e);
        process::exit(2);
    }
}

async fn inspect(options: &Options) -> PDFResult<()> {
    let mut load = LoadOptions::default();
    if let Some(password) = &options.password {
        load = load.with_password(password);
    }
    if let Some(chunk_size) = options.chunk_size {
        load = load.with_chunk_size(chunk_size);
    }

    let doc = PDFDocument::open_file(&options.path, load).await?;

    println!("File:       {}", options.path);
    println!("Pages:      {}", doc.page_count());
    println!("Revisions:  {}", doc.revision_count());
    println!("Encrypted:  {}", doc.is_encrypted());
    if let Some(permissions) = doc.permissions() {
        println!(
            "Permissions: print={} copy={} modify={}",
            permissions.print, permissions.copy, permissions.modify
        );
    }

    if options.show_xref {
        print_xref(&doc)?;
    }
    if options.show_trailer {
        println!("\n=== Trailer ===");
        for (key, value) in doc.store().trailer()? {
            println!("  /{} {}", key, describe(&value));
        }
    }
    if options.show_pages {
        println!("\n=== Pages ===");
        for index in 0..doc.page_count() {
            let page = doc.get_page(index).await?;
            let [x1, y1, x2, y2] = page.media_box();
            println!(
                "  Page {}: {:.0} x {:.0} pt, rotate {}, {} content stream(s)",
                index + 1,
                x2 - x1,
                y2 - y1,
                page.rotate(),
                page.contents().len()
            );
        }
    }
    if let Some(num) = options.object {
        print_object(&doc, num, options.revision).await?;
    }
    if let Some(page) = options.ops_page {
        print_operators(&doc, page, options.json).await?;
    }
    if options.show_stats {
        let stats = doc.stats();
        println!("\n=== Statistics ===");
        println!("  Objects parsed:    {}", stats.object_parses);
        println!("  Cache hits:        {}", stats.cache_hits);
        println!("  Range requests:    {}", stats.range_requests);
        println!("  Sequential reads:  {}", stats.sequential_reads);
        println!("  Bytes loaded:      {}", stats.bytes_loaded);
    }
    if options.show_warnings {
        let warnings = doc.diagnostics().warnings();
        println!("\n=== Warnings ({}) ===", warnings.len());
        for warning in warnings {
            println!("  {:?}: {}", warning.kind, warning.message);
        }
    }
    Ok(())
}

fn print_xref(doc: &PDFDocument) -> PDFResult<()> {
    let xref = doc.store().xref()?;
    println!("\n=== Cross-reference ===");
    if xref.is_repaired() {
        println!("  (rebuilt by scanning the file)");
    }
    for (rev, section) in xref.sections().iter().rev().enumerate() {
        let kind = match section.kind {
            SectionKind::Table => "table",
            SectionKind::Stream => "stream",
            SectionKind::Reconstructed => "reconstructed",
        };
        let offset = section.offset.map_or("-".to_string(), |o| o.to_string());
        println!(
            "  Revision {}: {} at {}, {} entries",
            rev,
            kind,
            offset,
            section.entries.len()
        );
    }

    let mut numbers = xref.object_numbers();
    numbers.sort_unstable();
    for num in numbers.into_iter().take(50) {
        match xref.get_entry(num) {
            Some(XRefEntry::Uncompressed { offset, generation }) => {
                println!("    {:>5} {:>3}  offset {}", num, generation, offset)
            }
            Some(XRefEntry::Compressed {
                obj_stream_num,
                index,
            }) => println!("    {:>5}   0  in object stream {} #{}", num, obj_stream_num, index),
            Some(XRefEntry::Free { generation, .. }) => println!("    {:>5} {:>3}  free", num, generation),
            None => {}
        }
    }
    Ok(())
}

async fn print_object(doc: &PDFDocument, num: u32, revision: Option<usize>) -> PDFResult<()> {
    let generation = doc
        .store()
        .xref()?
        .get_entry(num)
        .map_or(0, |entry| entry.generation());
    let reference = Ref::new(num, generation);
    let object = match revision {
        Some(rev) => doc.fetch_at_revision(reference, rev).await?,
        None => (*doc.fetch(reference).await?).clone(),
    };
    println!("\n=== Object {} ===", reference);
    match &object {
        PDFObject::Dictionary(dict) => {
            for (key, value) in dict {
                println!("  /{} {}", key, describe(value));
            }
        }
        PDFObject::Stream(stream) => {
            for (key, value) in &stream.dict {
                println!("  /{} {}", key, describe(value));
            }
            let bytes = doc.get_stream_bytes(reference).await?;
            println!("  stream: {} raw bytes, {} decoded", stream.raw.len(), bytes.len());
        }
        other => println!("  {}", describe(other)),
    }
    Ok(())
}

async fn print_operators(doc: &PDFDocument, page: usize, json: bool) -> PDFResult<()> {
    if page == 0 || page > doc.page_count() {
        eprintln!("Error: page {} out of range (1-{})", page, doc.page_count());
        return Ok(());
    }
    let list = doc.operator_list(page - 1).await?;
    if json {
        let text = serde_json::to_string_pretty(&*list)?;
        println!("{}", text);
        return Ok(());
    }

    println!("\n=== Page {} operators ===", page);
    for operation in list.operations() {
        println!("  {}", operation);
    }
    println!(
        "  {} operations, {} resources{}",
        list.len(),
        list.dependencies().len(),
        if list.is_incomplete() { ", incomplete" } else { "" }
    );
    Ok(())
}

fn describe(object: &PDFObject) -> String {
    match object {
        PDFObject::Null => "null".to_string(),
        PDFObject::Boolean(b) => b.to_string(),
        PDFObject::Number(n) => n.to_string(),
        PDFObject::String(s) | PDFObject::HexString(s) => format!("({})", String::from_utf8_lossy(s)),
        PDFObject::Name(name) => format!("/{}", name),
        PDFObject::Ref(r) => r.to_string(),
        PDFObject::Array(items) if items.len() <= 8 => {
            let parts: Vec<String> = items.iter().map(describe).collect();
            format!("[{}]", parts.join(" "))
        }
        PDFObject::Array(items) => format!("[{} items]", items.len()),
        PDFObject::Dictionary(dict) => format!("<<{} keys>>", dict.len()),
        other => other.kind().to_string(),
    }
}
