use criterion::{black_box, criterion_group, criterion_main, Criterion};

use scribe_collab::compress::DeltaCompressor;
use scribe_collab::document::SharedDocument;
use scribe_proto::{AwarenessDatagram, FrameAssembler, Op};

fn bench_insert_encode(c: &mut Criterion) {
    let op = Op::Insert {
        pos: 1024,
        text: "hello world".to_string(),
    };

    c.bench_function("insert_encode", |b| {
        b.iter(|| {
            black_box(black_box(&op).to_frame().unwrap());
        })
    });
}

fn bench_insert_decode(c: &mut Criterion) {
    let op = Op::Insert {
        pos: 1024,
        text: "hello world".to_string(),
    };
    let body = op.encode_body().unwrap();

    c.bench_function("insert_decode", |b| {
        b.iter(|| {
            black_box(Op::decode(black_box(&body)).unwrap());
        })
    });
}

fn bench_batch_roundtrip(c: &mut Criterion) {
    let op = Op::Batch {
        start: 0,
        segments: (0..64).map(|_| "x".to_string()).collect(),
    };

    c.bench_function("batch_roundtrip_64_segments", |b| {
        b.iter(|| {
            let body = black_box(&op).encode_body().unwrap();
            black_box(Op::decode(&body).unwrap());
        })
    });
}

fn bench_assembler_chunked(c: &mut Criterion) {
    // One 1 KiB frame delivered in 64-byte chunks.
    let frame = Op::Raw(vec![0xab; 1024]).to_frame().unwrap();
    let chunks: Vec<&[u8]> = frame.chunks(64).collect();

    c.bench_function("assembler_1KiB_in_64B_chunks", |b| {
        b.iter(|| {
            let mut asm = FrameAssembler::new();
            for chunk in &chunks {
                asm.push(black_box(chunk));
            }
            black_box(asm.next_body().unwrap());
        })
    });
}

fn bench_compressor_typing_burst(c: &mut Criterion) {
    c.bench_function("compressor_100_contiguous_inserts", |b| {
        b.iter(|| {
            let mut compressor = DeltaCompressor::new();
            for i in 0..100u32 {
                black_box(compressor.push_insert(i, "x"));
            }
            black_box(compressor.flush());
        })
    });
}

fn bench_awareness_datagram(c: &mut Criterion) {
    let dg = AwarenessDatagram::new(42, 10, 5, 15);
    let bytes = dg.encode();

    c.bench_function("awareness_datagram_roundtrip", |b| {
        b.iter(|| {
            let encoded = black_box(&dg).encode();
            black_box(AwarenessDatagram::decode(black_box(&encoded)).unwrap());
            black_box(AwarenessDatagram::decode(&bytes).unwrap());
        })
    });
}

fn bench_document_merge(c: &mut Criterion) {
    let source = SharedDocument::new();
    source.insert(0, &"lorem ipsum ".repeat(32)).unwrap();
    let update = source.full_state();

    c.bench_function("document_merge_384B_update", |b| {
        b.iter(|| {
            let doc = SharedDocument::new();
            black_box(doc.apply_remote_update(black_box(&update)).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_insert_encode,
    bench_insert_decode,
    bench_batch_roundtrip,
    bench_assembler_chunked,
    bench_compressor_typing_burst,
    bench_awareness_datagram,
    bench_document_merge,
);
criterion_main!(benches);
