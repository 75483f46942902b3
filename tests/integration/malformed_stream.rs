#![allow(missing_docs)]

mod support;

use std::sync::Arc;

use scmo::stream::CounterMetrics;
use scmo::{Instance, ScmoError, Streamer, StreamerOptions, Value};

use support::{
    get_u64, instance_chunks, kitchen_sink_class, link, link_class, put_u32, put_u64,
    table_offsets,
};

const NUM_EXT_REF: usize = 32;
const EXT_REF_CAPACITY: usize = 36;
const EXT_REF_ARRAY: usize = 40;
const VALUE_ARRAY: usize = 104;
const SLOT_LEN: usize = 24;

/// Two classes, three instances and three references.
fn sample_stream() -> Vec<u8> {
    let links = link_class();
    let sink = Instance::new(&kitchen_sink_class()).unwrap();
    sink.set_property("Text", Value::String("payload".into())).unwrap();
    let a = link(&links, 1);
    let b = link(&links, 2);
    a.set_property("Left", Value::Reference(b.clone())).unwrap();
    a.set_property("Right", Value::Reference(b.clone())).unwrap();
    sink.set_property("Inner", Value::Instance(a.clone())).unwrap();
    Streamer::default().serialize_to_vec(&[sink]).unwrap()
}

fn assert_malformed(bytes: &[u8]) {
    match Streamer::default().deserialize(bytes) {
        Err(err) => assert!(err.is_malformed(), "unexpected error kind: {err}"),
        Ok(out) => panic!("accepted a corrupt stream with {} instances", out.len()),
    }
}

#[test]
fn sample_stream_is_well_formed() {
    let bytes = sample_stream();
    assert_eq!(Streamer::default().deserialize(&bytes).unwrap().len(), 1);
}

#[test]
fn every_truncation_is_rejected() {
    let bytes = sample_stream();
    let metrics = Arc::new(CounterMetrics::default());
    let streamer = Streamer::new(StreamerOptions::new().metrics(metrics.clone()));
    for len in 0..bytes.len() {
        match streamer.deserialize(&bytes[..len]) {
            Err(err) => assert!(err.is_malformed(), "prefix {len}: {err}"),
            Ok(_) => panic!("prefix of {len} bytes was accepted"),
        }
    }
    let snap = metrics.snapshot();
    assert_eq!(snap.streams_rejected, bytes.len() as u64);
    assert_eq!(snap.streams_read, 0);
}

#[test]
fn truncation_at_table_boundaries() {
    let bytes = sample_stream();
    let offsets = table_offsets(&bytes);
    for cut in [
        4,
        20,
        offsets.instance_count,
        offsets.class_resolution + 8,
        offsets.reference_count,
        offsets.references + 16,
        offsets.first_instance,
        offsets.first_instance + 30,
    ] {
        assert_malformed(&bytes[..cut]);
    }
}

#[test]
fn oversized_chunk_length_is_rejected_before_allocating() {
    let mut bytes = sample_stream();
    put_u64(&mut bytes, 4, u64::MAX);
    assert_malformed(&bytes);

    let lenient = Streamer::new(StreamerOptions::new().max_chunk_len(u64::MAX));
    assert!(lenient.deserialize(&bytes).unwrap_err().is_malformed());
}

#[test]
fn oversized_counts_are_rejected() {
    let mut bytes = sample_stream();
    bytes[..4].copy_from_slice(&u32::MAX.to_le_bytes());
    assert_malformed(&bytes);

    let mut bytes = sample_stream();
    let at = table_offsets(&bytes).reference_count;
    bytes[at..at + 4].copy_from_slice(&(1u32 << 19).to_le_bytes());
    assert_malformed(&bytes);
}

#[test]
fn dangling_reference_target_is_rejected() {
    let mut bytes = sample_stream();
    let at = table_offsets(&bytes).references + 8;
    put_u64(&mut bytes, at, 99);
    assert_malformed(&bytes);
}

#[test]
fn zero_reference_tag_is_rejected() {
    let mut bytes = sample_stream();
    let at = table_offsets(&bytes).references;
    put_u64(&mut bytes, at, 0);
    assert_malformed(&bytes);
}

#[test]
fn repeated_reference_tag_is_rejected() {
    let mut bytes = sample_stream();
    let at = table_offsets(&bytes).references;
    let first = u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap());
    put_u64(&mut bytes, at + 16, first);
    assert_malformed(&bytes);
}

#[test]
fn unknown_slot_tag_is_rejected() {
    let mut bytes = sample_stream();
    let at = table_offsets(&bytes).references;
    put_u64(&mut bytes, at, 77);
    assert_malformed(&bytes);
}

#[test]
fn class_index_out_of_range_is_rejected() {
    let mut bytes = sample_stream();
    let at = table_offsets(&bytes).class_resolution + 8;
    put_u64(&mut bytes, at, 5);
    assert_malformed(&bytes);
}

#[test]
fn repeated_root_ordinal_is_rejected() {
    let class = link_class();
    let mut bytes = Streamer::default()
        .serialize_to_vec(&[link(&class, 1), link(&class, 2)])
        .unwrap();
    let at = table_offsets(&bytes).class_resolution;
    let first = u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap());
    put_u64(&mut bytes, at + 16, first);
    assert_malformed(&bytes);
}

#[test]
fn corrupt_instance_magic_is_rejected() {
    let mut bytes = sample_stream();
    let at = table_offsets(&bytes).first_instance + 8;
    bytes[at] ^= 0xFF;
    assert_malformed(&bytes);
}

#[test]
fn corrupt_class_magic_is_rejected() {
    let mut bytes = sample_stream();
    bytes[12] ^= 0xFF;
    assert_malformed(&bytes);
}

#[test]
fn trailing_garbage_is_rejected() {
    let mut bytes = sample_stream();
    bytes.push(0);
    assert_malformed(&bytes);
}

#[test]
fn instance_stream_is_not_a_class_stream() {
    let bytes = sample_stream();
    let err = Streamer::default().deserialize_class(&bytes).unwrap_err();
    assert!(matches!(err, ScmoError::Malformed(_)));
}

/// One `Test_Link` instance with both references unset.
fn unlinked_stream() -> Vec<u8> {
    Streamer::default()
        .serialize_to_vec(&[link(&link_class(), 1)])
        .unwrap()
}

#[test]
fn unlinked_stream_accepts_later_references() {
    let bytes = unlinked_stream();
    let out = Streamer::default().deserialize(&bytes).unwrap();
    let class = link_class();
    out[0].set_property("Left", Value::Reference(link(&class, 2))).unwrap();
    out[0].set_property("Right", Value::Reference(link(&class, 3))).unwrap();
    assert_eq!(out[0].number_of_external_references(), 2);
    let stats = out[0].chunk_stats();
    assert_eq!(stats.free_bytes + stats.used_bytes, stats.total_size);
}

#[test]
fn external_reference_array_over_the_header_is_rejected() {
    let mut bytes = unlinked_stream();
    let chunk = instance_chunks(&bytes)[0];
    put_u32(&mut bytes, chunk + EXT_REF_CAPACITY, 6);
    put_u64(&mut bytes, chunk + EXT_REF_ARRAY, 0);
    assert_malformed(&bytes);
}

#[test]
fn external_reference_array_over_the_values_is_rejected() {
    let mut bytes = unlinked_stream();
    let chunk = instance_chunks(&bytes)[0];
    let values = get_u64(&bytes, chunk + VALUE_ARRAY);
    put_u32(&mut bytes, chunk + EXT_REF_CAPACITY, 2);
    put_u64(&mut bytes, chunk + EXT_REF_ARRAY, values);
    assert_malformed(&bytes);
}

#[test]
fn misaligned_external_reference_array_is_rejected() {
    let mut bytes = unlinked_stream();
    let chunk = instance_chunks(&bytes)[0];
    put_u32(&mut bytes, chunk + EXT_REF_CAPACITY, 1);
    put_u64(&mut bytes, chunk + EXT_REF_ARRAY, 113);
    assert_malformed(&bytes);
}

#[test]
fn value_array_over_the_header_is_rejected() {
    let mut bytes = unlinked_stream();
    let chunk = instance_chunks(&bytes)[0];
    put_u64(&mut bytes, chunk + VALUE_ARRAY, 0);
    assert_malformed(&bytes);
}

#[test]
fn reference_tag_carried_by_two_slots_is_rejected() {
    let class = link_class();
    let a = link(&class, 1);
    a.set_property("Left", Value::Reference(link(&class, 2))).unwrap();
    a.set_property("Right", Value::Reference(link(&class, 3))).unwrap();
    let mut bytes = Streamer::default().serialize_to_vec(&[a.clone()]).unwrap();
    a.clear_property("Left").unwrap();
    a.clear_property("Right").unwrap();

    let chunk = instance_chunks(&bytes)
        .into_iter()
        .find(|&at| bytes[at + NUM_EXT_REF] == 2)
        .expect("instance with two references");
    let values = get_u64(&bytes, chunk + VALUE_ARRAY) as usize;
    let left_tag = chunk + values + SLOT_LEN + 8;
    let right_tag = chunk + values + 2 * SLOT_LEN + 8;
    let tag = get_u64(&bytes, left_tag);
    put_u64(&mut bytes, right_tag, tag);
    assert_malformed(&bytes);
}

#[test]
fn reference_entry_without_a_slot_is_rejected() {
    let mut bytes = sample_stream();
    let offsets = table_offsets(&bytes);
    let count = u32::from_le_bytes(
        bytes[offsets.reference_count..offsets.reference_count + 4]
            .try_into()
            .unwrap(),
    );
    put_u32(&mut bytes, offsets.reference_count, count + 1);
    let mut entry = Vec::with_capacity(16);
    entry.extend_from_slice(&u64::from(count + 1).to_le_bytes());
    entry.extend_from_slice(&0u64.to_le_bytes());
    bytes.splice(offsets.first_instance..offsets.first_instance, entry);
    assert_malformed(&bytes);
}
