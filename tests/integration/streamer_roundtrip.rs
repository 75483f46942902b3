#![allow(missing_docs)]

mod support;

use std::sync::Arc;

use scmo::primitives::bytes::buf::WireReader;
use scmo::stream::{summarize, CounterMetrics};
use scmo::{Class, Instance, Streamer, StreamerOptions, Value};

use support::{
    assert_isomorphic, id_of, kitchen_sink_class, link, link_class, stream_counts,
};

fn round_trip(roots: &[Instance]) -> (Vec<u8>, Vec<Instance>) {
    let streamer = Streamer::default();
    let bytes = streamer.serialize_to_vec(roots).expect("serialize");
    let out = streamer.deserialize(&bytes).expect("deserialize");
    (bytes, out)
}

fn reference(inst: &Instance, name: &str) -> Option<Instance> {
    inst.property(name)
        .expect("property")
        .and_then(|v| v.as_instance().cloned())
}

#[test]
fn every_value_type_survives_a_round_trip() {
    let class = kitchen_sink_class();
    let inner_class = link_class();
    let inst = Instance::new(&class).unwrap();
    inst.set_property("Id", Value::Uint32(7)).unwrap();
    inst.set_property("Flag", Value::Boolean(true)).unwrap();
    inst.set_property("U8", Value::Uint8(200)).unwrap();
    inst.set_property("S8", Value::Sint8(-100)).unwrap();
    inst.set_property("U16", Value::Uint16(65_000)).unwrap();
    inst.set_property("S16", Value::Sint16(-30_000)).unwrap();
    inst.set_property("S32", Value::Sint32(i32::MIN)).unwrap();
    inst.set_property("U64", Value::Uint64(u64::MAX)).unwrap();
    inst.set_property("S64", Value::Sint64(-42)).unwrap();
    inst.set_property("R32", Value::Real32(1.5)).unwrap();
    inst.set_property("R64", Value::Real64(-2.25e300)).unwrap();
    inst.set_property("C16", Value::Char16(0x263A)).unwrap();
    inst.set_property("Text", Value::String("héllo wörld".into())).unwrap();
    inst.set_property(
        "Numbers",
        Value::Array(vec![Value::Sint64(1), Value::Sint64(-2), Value::Sint64(3)]),
    )
    .unwrap();
    inst.set_property(
        "Words",
        Value::Array(vec![Value::String("a".into()), Value::String(String::new())]),
    )
    .unwrap();
    inst.set_property("Embedded", Value::Object(link(&inner_class, 1))).unwrap();
    inst.set_property("Inner", Value::Instance(link(&inner_class, 2))).unwrap();
    inst.set_host_name("host-a").unwrap();
    inst.set_namespace("root/cimv2").unwrap();

    let (bytes, out) = round_trip(&[inst.clone()]);
    assert_eq!(stream_counts(&bytes), (2, 3, 2));
    assert_eq!(out.len(), 1);
    assert_isomorphic(&[inst], &out);

    let copy = &out[0];
    assert_eq!(copy.property("Text").unwrap(), Some(Value::String("héllo wörld".into())));
    assert!(matches!(copy.property("Embedded").unwrap(), Some(Value::Object(_))));
    assert!(matches!(copy.property("Inner").unwrap(), Some(Value::Instance(_))));
    assert_eq!(copy.host_name().unwrap(), "host-a");
    assert_eq!(copy.class().super_class().as_deref(), Some("Test_Base"));
    assert_eq!(copy.class().key_properties(), vec!["Id".to_string()]);
}

#[test]
fn root_order_is_preserved() {
    let class = link_class();
    let a = link(&class, 1);
    let b = link(&class, 2);
    let c = link(&class, 3);
    a.set_property("Left", Value::Reference(b.clone())).unwrap();
    b.set_property("Left", Value::Reference(c.clone())).unwrap();

    let (bytes, out) = round_trip(&[c.clone(), a.clone(), b.clone()]);
    assert_eq!(stream_counts(&bytes), (1, 3, 2));
    assert_eq!(out.iter().map(id_of).collect::<Vec<_>>(), vec![3, 1, 2]);
    assert!(Instance::ptr_eq(&reference(&out[1], "Left").unwrap(), &out[2]));
    assert!(Instance::ptr_eq(&reference(&out[2], "Left").unwrap(), &out[0]));
    assert_isomorphic(&[c, a, b], &out);
}

#[test]
fn shared_targets_stay_shared() {
    let class = link_class();
    let top = link(&class, 1);
    let left = link(&class, 2);
    let right = link(&class, 3);
    let bottom = link(&class, 4);
    top.set_property("Left", Value::Reference(left.clone())).unwrap();
    top.set_property("Right", Value::Reference(right.clone())).unwrap();
    left.set_property("Left", Value::Reference(bottom.clone())).unwrap();
    right.set_property("Right", Value::Reference(bottom.clone())).unwrap();

    let (bytes, out) = round_trip(&[top.clone()]);
    assert_eq!(stream_counts(&bytes), (1, 4, 4));
    assert_eq!(out.len(), 1);
    assert_isomorphic(&[top], &out);

    let l = reference(&out[0], "Left").unwrap();
    let r = reference(&out[0], "Right").unwrap();
    let via_left = reference(&l, "Left").unwrap();
    let via_right = reference(&r, "Right").unwrap();
    assert!(Instance::ptr_eq(&via_left, &via_right));
    assert_eq!(id_of(&via_left), 4);
}

#[test]
fn cycles_round_trip() {
    let class = link_class();
    let a = link(&class, 1);
    let b = link(&class, 2);
    a.set_property("Left", Value::Reference(b.clone())).unwrap();
    b.set_property("Left", Value::Reference(a.clone())).unwrap();
    a.set_property("Right", Value::Reference(a.clone())).unwrap();

    let (bytes, out) = round_trip(&[a.clone()]);
    assert_eq!(stream_counts(&bytes), (1, 2, 3));
    assert_eq!(out.len(), 1);
    assert_isomorphic(&[a.clone()], &out);

    let copy = &out[0];
    assert!(Instance::ptr_eq(&reference(copy, "Right").unwrap(), copy));
    let other = reference(copy, "Left").unwrap();
    assert!(Instance::ptr_eq(&reference(&other, "Left").unwrap(), copy));

    for inst in [&a, &b, copy, &other] {
        inst.clear_property("Left").unwrap();
        inst.clear_property("Right").unwrap();
    }
}

#[test]
fn null_references_are_not_streamed() {
    let class = link_class();
    let a = link(&class, 1);
    let b = link(&class, 2);
    a.set_property("Left", Value::Reference(b.clone())).unwrap();
    a.clear_property("Left").unwrap();

    let (bytes, out) = round_trip(&[a.clone()]);
    assert_eq!(stream_counts(&bytes), (1, 1, 0));
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].property("Left").unwrap(), None);
    assert_eq!(out[0].property("Right").unwrap(), None);
    assert_eq!(out[0].number_of_external_references(), 0);
    assert!(!out[0].is_property_set("Right").unwrap());
    assert_isomorphic(&[a], &out);
}

#[test]
fn classes_are_written_once() {
    let class = link_class();
    let roots: Vec<Instance> = (0..50).map(|i| link(&class, i)).collect();
    for pair in roots.windows(2) {
        pair[0]
            .set_property("Right", Value::Reference(pair[1].clone()))
            .unwrap();
    }

    let (bytes, out) = round_trip(&roots);
    assert_eq!(stream_counts(&bytes), (1, 50, 49));
    assert_eq!(out.len(), 50);
    let first = out[0].class();
    assert!(out.iter().all(|inst| Class::ptr_eq(&inst.class(), &first)));
    assert_isomorphic(&roots, &out);
}

#[test]
fn duplicate_roots_collapse_to_one_instance() {
    let class = link_class();
    let a = link(&class, 1);
    let b = link(&class, 2);
    let (bytes, out) = round_trip(&[a.clone(), b.clone(), a.clone()]);
    assert_eq!(stream_counts(&bytes), (1, 2, 0));
    assert_eq!(out.iter().map(id_of).collect::<Vec<_>>(), vec![1, 2]);
}

#[test]
fn deserialized_chunks_account_for_every_byte() {
    let class = kitchen_sink_class();
    let inner_class = link_class();
    let inst = Instance::new(&class).unwrap();
    inst.set_property("Text", Value::String("x".repeat(300))).unwrap();
    inst.set_property("Inner", Value::Instance(link(&inner_class, 9))).unwrap();
    let (_, out) = round_trip(&[inst]);

    let inner = reference(&out[0], "Inner").unwrap();
    for stats in [out[0].chunk_stats(), inner.chunk_stats(), out[0].class().chunk_stats()] {
        assert_eq!(stats.free_bytes + stats.used_bytes, stats.total_size);
    }
}

#[test]
fn headroom_absorbs_small_edits() {
    let class = link_class();
    let streamer = Streamer::new(StreamerOptions::new().instance_headroom(256));
    let bytes = streamer.serialize_to_vec(&[link(&class, 1)]).unwrap();
    let out = streamer.deserialize(&bytes).unwrap();
    let before = out[0].chunk_stats().total_size;
    out[0].set_host_name("a-fairly-long-host-name.example").unwrap();
    out[0].set_namespace("root/interop").unwrap();
    assert_eq!(out[0].chunk_stats().total_size, before);
    assert_eq!(out[0].namespace().unwrap(), "root/interop");
}

#[test]
fn second_hop_preserves_the_graph() {
    let class = link_class();
    let a = link(&class, 1);
    let b = link(&class, 2);
    a.set_property("Left", Value::Reference(b.clone())).unwrap();
    let (bytes, out) = round_trip(&[a.clone(), b.clone()]);
    let (again, twice) = round_trip(&out);
    assert_eq!(bytes.len(), again.len());
    assert_eq!(stream_counts(&bytes), stream_counts(&again));
    assert_isomorphic(&[a, b], &twice);
}

#[test]
fn streams_can_be_concatenated() {
    let class = link_class();
    let streamer = Streamer::default();
    let mut bytes = streamer.serialize_to_vec(&[link(&class, 1)]).unwrap();
    streamer.serialize(&mut bytes, &[link(&class, 2), link(&class, 3)]).unwrap();

    let mut reader = WireReader::new(&bytes);
    let first = streamer.deserialize_from(&mut reader).unwrap();
    let second = streamer.deserialize_from(&mut reader).unwrap();
    assert_eq!(reader.remaining(), 0);
    assert_eq!(first.iter().map(id_of).collect::<Vec<_>>(), vec![1]);
    assert_eq!(second.iter().map(id_of).collect::<Vec<_>>(), vec![2, 3]);
}

#[test]
fn summary_matches_the_stream() {
    let class = link_class();
    let a = link(&class, 1);
    let b = link(&class, 2);
    a.set_property("Left", Value::Reference(b.clone())).unwrap();
    let bytes = Streamer::default().serialize_to_vec(&[a, b]).unwrap();

    let summary = summarize(&bytes, &StreamerOptions::default()).unwrap();
    assert_eq!(summary.classes[0].name, "Test_Link");
    let roots: Vec<_> = summary.instances.iter().map(|i| i.root_ordinal).collect();
    assert_eq!(roots, vec![Some(1), Some(0)]);
    assert_eq!(summary.instance_references.len(), 1);
    assert_eq!(summary.instance_references[0].index, 0);
}

#[test]
fn serializing_from_many_threads() {
    let class = link_class();
    let shared = link(&class, 0);
    let metrics = Arc::new(CounterMetrics::default());
    let streamer = Streamer::new(StreamerOptions::new().metrics(metrics.clone()));

    std::thread::scope(|scope| {
        for i in 1..=4 {
            let class = class.clone();
            let shared = shared.clone();
            let streamer = &streamer;
            scope.spawn(move || {
                let root = link(&class, i);
                root.set_property("Left", Value::Reference(shared)).unwrap();
                let bytes = streamer.serialize_to_vec(&[root]).unwrap();
                let out = streamer.deserialize(&bytes).unwrap();
                assert_eq!(id_of(&out[0]), i);
                assert_eq!(id_of(&reference(&out[0], "Left").unwrap()), 0);
            });
        }
    });

    let snap = metrics.snapshot();
    assert_eq!(snap.streams_written, 4);
    assert_eq!(snap.streams_read, 4);
    assert_eq!(snap.streams_rejected, 0);
}
