//! Benchmarks for pipeline execution.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use flowline::pipeline::PipelineBuilder;

fn pipeline_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("invoke_single_item", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let pipeline = PipelineBuilder::new()
                    .add_inline_step(|req| async move {
                        req.item().add(1u64);
                        Ok(())
                    })
                    .build()
                    .unwrap();
                black_box(pipeline.invoke(42u64).await.unwrap())
            })
        });
    });

    c.bench_function("invoke_many_inline_chain", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let pipeline = PipelineBuilder::new()
                    .add_inline_step(|req| async move {
                        req.item().add(1u64);
                        Ok(())
                    })
                    .add_inline_filter(|_req| async move { Ok(true) })
                    .add_inline_step(|req| async move {
                        req.item().add(2u64);
                        Ok(())
                    })
                    .build()
                    .unwrap();
                black_box(pipeline.invoke_many_sync(0..100u64, Some(4)).await.unwrap())
            })
        });
    });
}

criterion_group!(benches, pipeline_benchmark);
criterion_main!(benches);
