use relay_protocol::WireEvent;

const COORD_MIN: f64 = -10.0;
const COORD_MAX: f64 = 100_000.0;
const KEY_MAX_LEN: usize = 20;
const TEXT_MAX_LEN: usize = 500;

/// Enforces §4.6's type/range/length constraints on every viewer-originated
/// event before it is forwarded to an agent. Failure is always a silent
/// drop — the caller never relays an error back to the viewer (a hostile
/// viewer must not be able to crash or DoS the agent's injection layer).
pub fn is_valid(event: &WireEvent) -> bool {
    match event {
        WireEvent::MouseMove(p)
        | WireEvent::MouseClick(p)
        | WireEvent::MouseDoubleClick(p)
        | WireEvent::MouseRightClick(p)
        | WireEvent::MouseDown(p)
        | WireEvent::MouseUp(p) => valid_point(p),

        WireEvent::MouseScroll(s) => {
            in_range(s.x) && in_range(s.y) && s.delta_x.is_finite() && s.delta_y.is_finite()
        }

        WireEvent::KeyPress(k) => {
            k.key.chars().count() <= KEY_MAX_LEN
                && k.modifiers
                    .as_ref()
                    .is_none_or(|mods| mods.iter().all(|m| is_known_modifier(m)))
        }

        WireEvent::KeyType(k) => k.text.chars().count() <= TEXT_MAX_LEN,

        WireEvent::UpdateQuality(q) => (10..=100).contains(&q.quality),
        WireEvent::UpdateFps(f) => (1..=60).contains(&f.fps),

        WireEvent::ListScreens
        | WireEvent::SwitchScreen(_)
        | WireEvent::ClipboardWrite(_)
        | WireEvent::ClipboardRead => true,

        // Not a viewer-originated event; the dispatcher never routes these
        // here, but treat as invalid defensively rather than forwarding.
        _ => false,
    }
}

fn valid_point(p: &relay_protocol::MousePoint) -> bool {
    in_range(p.x) && in_range(p.y)
}

fn in_range(v: f64) -> bool {
    v.is_finite() && v >= COORD_MIN && v <= COORD_MAX
}

fn is_known_modifier(m: &str) -> bool {
    matches!(m, "ctrl" | "alt" | "shift" | "meta")
}
