use arbor_engine::{Constraints, Element, RunMode, TreeEngine, UpdateMode};
use arbor_core::{ComponentKey, StateUpdate};
use arbor_testing::{Column, Counter, Row, Text};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

const SECTION_COUNT: usize = 4;
const ROWS_PER_SECTION: usize = 32;
const ROW_SAMPLES: &[usize] = &[8, 16, 32, 64];

fn content(sections: usize, rows_per_section: usize) -> Element {
    let sections = (0..sections)
        .map(|section| {
            let mut children = vec![Element::new(Text::new(format!("Section {section}")))];
            children.extend((0..rows_per_section).map(|row| {
                Element::new(Row::new(vec![
                    Element::new(Text::new(format!("Item {section}-{row}")).sized(120.0, 16.0)),
                    Element::new(Text::new(format!("Detail {section}-{row}")).sized(60.0, 16.0)),
                ]))
            }));
            Element::new(Column::new(children))
        })
        .collect();
    Element::new(Column::new(sections).spaced_by(8.0))
}

fn element_count(sections: usize, rows_per_section: usize) -> usize {
    1 + sections * (2 + rows_per_section * 3)
}

fn engine() -> TreeEngine {
    let engine = TreeEngine::new();
    engine.set_constraints(Constraints::loose(1080.0, 1920.0));
    engine
}

fn bench_full_compute(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_full");
    for &rows_per_section in ROW_SAMPLES {
        group.bench_with_input(
            BenchmarkId::new("elements", element_count(SECTION_COUNT, rows_per_section)),
            &rows_per_section,
            |b, &rows_per_section| {
                let engine = engine();
                b.iter(|| {
                    // A fresh root element defeats reconciliation.
                    engine.set_root(content(SECTION_COUNT, rows_per_section));
                    black_box(engine.compute(RunMode::Sync).expect("compute"));
                });
            },
        );
    }
    group.finish();
}

fn bench_incremental_compute(c: &mut Criterion) {
    let engine = engine();
    let counter = Counter::new(0);
    let mut children = vec![Element::new(counter).keyed("counter")];
    children.push(content(SECTION_COUNT, ROWS_PER_SECTION));
    engine.set_root(Column::new(children));
    engine.compute(RunMode::Sync).expect("compute");
    let key = ComponentKey::new("root/counter").state(0);

    c.bench_function("pipeline_incremental", |b| {
        b.iter(|| {
            engine
                .update_state(key.clone(), StateUpdate::apply(|v: &i32| v + 1), UpdateMode::Sync)
                .expect("update");
            black_box(engine.committed());
        });
    });
}

fn bench_unchanged_compute(c: &mut Criterion) {
    let engine = engine();
    engine.set_root(content(SECTION_COUNT, ROWS_PER_SECTION));
    engine.compute(RunMode::Sync).expect("compute");

    c.bench_function("pipeline_unchanged", |b| {
        b.iter(|| {
            black_box(engine.compute(RunMode::Sync).expect("compute"));
        });
    });
}

criterion_group!(
    pipeline,
    bench_full_compute,
    bench_incremental_compute,
    bench_unchanged_compute
);
criterion_main!(pipeline);
