//! Minimal smoke test for the CST arena's commit protocol: write a header,
//! flush one page, commit a transaction, and read it back. Runs on the
//! `tokio-uring` runtime — the arena's page I/O never touches the ordinary
//! `tokio` runtime the RPC client and query op use (see `net`/`query`).

use columnfan::format::{BinaryFormatVersion, Column, Schema};
use columnfan::storage::{CstArena, PageBacking};

fn main() {
    tracing_subscriber::fmt::init();

    tokio_uring::start(async {
        let data_dir = std::env::temp_dir().join("columnfan-smoke-test");
        std::fs::create_dir_all(&data_dir).expect("create data dir");
        let path = data_dir.join("table.cst");

        let schema = Schema::new(vec![Column::leaf("x", "i64", false)]).expect("valid schema");
        let file = tokio_uring::fs::File::create(&path).await.expect("create file");
        let backing = PageBacking::FileBacked(tokio_uring::fs::File::open(&path).await.expect("open file"));

        let arena = CstArena::new(BinaryFormatVersion::V0_2_0, schema, backing).expect("construct arena");

        arena.write_header(&file).await.expect("write header");

        let page_id = arena.page_manager().allocate_page(0, 1, 8);
        arena
            .page_manager()
            .flush_page(page_id, vec![0u8; 8])
            .await
            .expect("flush page");

        let (index_offset, index_size) = arena.write_index(&file).await.expect("write index");
        arena.commit(1, 1);
        arena
            .write_transaction(&file, index_offset, index_size)
            .await
            .expect("write transaction");
        file.sync_all().await.expect("fsync");

        let (meta, _header) = CstArena::open_reader(&file).await.expect("open reader");
        tracing::info!(
            transaction_id = meta.transaction_id,
            num_rows = meta.num_rows,
            "cst arena smoke test passed"
        );
    });
}
