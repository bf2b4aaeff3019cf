use criterion::{criterion_group, criterion_main, Criterion};
use pairlink_core::control::{ChatRoomSummary, ControlCodec, ControlEvent, RemoteDesktopEvent};

fn bench_pointer_events(c: &mut Criterion) {
    let event = ControlEvent::remote_desktop(RemoteDesktopEvent::mouse_move(812.5, 433.0));
    let text = ControlCodec::encode(&event).expect("encode pointer event");

    c.bench_function("encode_mousemove", |b| {
        b.iter(|| {
            let _ = ControlCodec::encode(&event).expect("encode pointer event");
        })
    });

    c.bench_function("decode_mousemove", |b| {
        b.iter(|| {
            let _ = ControlCodec::decode(&text).expect("decode pointer event");
        })
    });
}

fn bench_chat_list(c: &mut Criterion) {
    let event = ControlEvent::ChatList {
        user_id: "user-42".to_string(),
        chat_data: ChatRoomSummary {
            id: "room-7".to_string(),
            participants: vec!["user-42".to_string(), "user-7".to_string()],
            last_message: Some("see you tomorrow".repeat(8)),
        },
    };
    let text = ControlCodec::encode(&event).expect("encode chat list");

    c.bench_function("decode_chat_list", |b| {
        b.iter(|| {
            let _ = ControlCodec::decode(&text).expect("decode chat list");
        })
    });

    c.bench_function("decode_unknown_type", |b| {
        b.iter(|| {
            let _ = ControlCodec::decode(r#"{"type":"file-transfer","name":"a.txt"}"#);
        })
    });
}

criterion_group!(benches, bench_pointer_events, bench_chat_list);
criterion_main!(benches);
