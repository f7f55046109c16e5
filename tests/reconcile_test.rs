use chrono::NaiveDate;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashSet;

use plania_sync::model::{ContentType, DiaryContentRecord};
use plania_sync::reconcile::{compute_stats, find_orphan_anticipations, reconcile};

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn class(id: &str, content_id: &str, day: &str, time: &str) -> DiaryContentRecord {
    DiaryContentRecord {
        id: id.into(),
        content_id: content_id.into(),
        date: date(day),
        time_range: time.into(),
        kind: ContentType::Normal,
        content: String::new(),
        observations: String::new(),
        original_content_id: None,
        original_date: None,
        is_non_presential: false,
    }
}

fn anticipation(
    id: &str,
    content_id: &str,
    day: &str,
    time: &str,
    original: &str,
    original_day: &str,
) -> DiaryContentRecord {
    DiaryContentRecord {
        kind: ContentType::Anticipation,
        original_content_id: Some(original.into()),
        original_date: Some(date(original_day)),
        ..class(id, content_id, day, time)
    }
}

fn ids(out: &[&DiaryContentRecord]) -> Vec<String> {
    out.iter().map(|r| r.id.clone()).collect()
}

#[test]
fn anticipation_is_followed_by_its_original() {
    let records = vec![
        class("c3", "X1", "2024-03-08", "08:00-10:00"),
        anticipation("c2", "X2", "2024-03-04", "08:00-10:00", "X1", "2024-03-08"),
        class("c1", "X0", "2024-03-01", "08:00-10:00"),
    ];
    assert_eq!(ids(&reconcile(&records)), vec!["c1", "c2", "c3"]);
}

#[test]
fn pairing_overrides_date_order() {
    // The cancelled original falls between two later classes by date, yet is
    // shown right under the anticipation that replaced it.
    let records = vec![
        class("c1", "X0", "2024-03-01", "08:00-10:00"),
        class("orig", "X1", "2024-03-05", "08:00-10:00"),
        class("c4", "X4", "2024-03-06", "08:00-10:00"),
        anticipation("ant", "X2", "2024-03-10", "08:00-10:00", "X1", "2024-03-05"),
        class("c5", "X5", "2024-03-12", "08:00-10:00"),
    ];
    assert_eq!(
        ids(&reconcile(&records)),
        vec!["c1", "c4", "ant", "orig", "c5"]
    );
}

#[test]
fn missing_original_is_not_an_error() {
    let records = vec![
        class("c1", "X0", "2024-03-01", "08:00-10:00"),
        anticipation("ant", "X2", "2024-03-02", "08:00-10:00", "GONE", "2024-03-09"),
    ];
    assert_eq!(ids(&reconcile(&records)), vec!["c1", "ant"]);
    assert_eq!(ids(&find_orphan_anticipations(&records)), vec!["ant"]);
}

#[test]
fn without_anticipations_output_is_sorted_input() {
    let records = vec![
        class("d", "X4", "2024-04-01", "08:00-10:00"),
        class("b", "X2", "2024-03-01", "13:00-15:00"),
        class("a", "X1", "2024-03-01", "08:00-10:00"),
        class("c", "X3", "2024-03-15", "07:00-08:00"),
    ];
    assert_eq!(ids(&reconcile(&records)), vec!["a", "b", "c", "d"]);
}

#[test]
fn makeup_classes_sort_with_regular_ones() {
    let mut makeup = class("r", "X9", "2024-03-02", "18:00-20:00");
    makeup.kind = ContentType::Makeup;
    let records = vec![class("n", "X1", "2024-03-03", "08:00-10:00"), makeup];
    assert_eq!(ids(&reconcile(&records)), vec!["r", "n"]);

    let stats = compute_stats(&records);
    assert_eq!(stats.real_classes, 2);
    assert_eq!(stats.anticipations, 0);
}

fn sample_diary() -> Vec<DiaryContentRecord> {
    let mut records = Vec::new();
    for day in 1..=20u32 {
        let d = format!("2024-05-{day:02}");
        records.push(class(&format!("m{day}"), &format!("M{day}"), &d, "07:30-09:10"));
        records.push(class(&format!("t{day}"), &format!("T{day}"), &d, "13:00-14:40"));
    }
    // Three anticipations pulling later classes forward, one orphan.
    records.push(anticipation("a1", "A1", "2024-05-02", "09:20-11:00", "M15", "2024-05-15"));
    records.push(anticipation("a2", "A2", "2024-05-07", "13:00-14:40", "T18", "2024-05-18"));
    records.push(anticipation("a3", "A3", "2024-05-07", "07:30-09:10", "T20", "2024-05-20"));
    records.push(anticipation("a4", "A4", "2024-05-09", "07:30-09:10", "NOPE", "2024-06-01"));
    records
}

#[test]
fn every_record_appears_exactly_once_in_date_order() {
    let mut records = sample_diary();
    let mut rng = StdRng::seed_from_u64(7);
    records.shuffle(&mut rng);

    let out = reconcile(&records);
    assert_eq!(out.len(), records.len());
    let unique: HashSet<&str> = out.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(unique.len(), records.len());

    let cancelled: HashSet<&str> = records
        .iter()
        .filter_map(|r| r.original_content_id.as_deref())
        .collect();

    let mut previous: Option<&DiaryContentRecord> = None;
    for (i, rec) in out.iter().enumerate() {
        if cancelled.contains(rec.content_id.as_str()) && !rec.is_anticipation() {
            let before = out[i - 1];
            assert!(before.is_anticipation());
            assert_eq!(before.original_content_id.as_deref(), Some(rec.content_id.as_str()));
            continue;
        }
        if let Some(prev) = previous {
            assert!(
                (prev.date, prev.time_range.as_str()) <= (rec.date, rec.time_range.as_str()),
                "{} sorted after {}",
                prev.id,
                rec.id
            );
        }
        previous = Some(rec);
    }
}

#[test]
fn stats_are_order_independent() {
    let records = sample_diary();
    let stats = compute_stats(&records);
    assert_eq!(stats.total, records.len());
    assert_eq!(stats.anticipations, 4);
    assert_eq!(stats.real_classes + stats.anticipations, stats.total);

    let mut shuffled = records.clone();
    shuffled.shuffle(&mut StdRng::seed_from_u64(42));
    assert_eq!(compute_stats(&shuffled), stats);
}
