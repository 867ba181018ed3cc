//! Text render of an evaluation for the control surface

use std::fmt::Write;

use super::EligibilityResult;
use crate::session::local;

fn price(v: Option<f64>) -> String {
    match v {
        Some(v) if v.is_finite() => format!("{:.2}", v),
        _ => "—".to_string(),
    }
}

/// Multi-line snapshot + checks + verdict
pub fn render(r: &EligibilityResult) -> String {
    let mut out = String::new();
    let buffer = if r.shifted.buffer.fract() == 0.0 {
        format!("{:.0}", r.shifted.buffer)
    } else {
        format!("{}", r.shifted.buffer)
    };
    let expiry = r
        .expiry
        .map(|d| d.to_string())
        .unwrap_or_else(|| "—".to_string());
    let age = r
        .age_seconds
        .map(|a| format!("{:.0}s", a))
        .unwrap_or_else(|| "—".to_string());
    let source = if r.source.is_empty() { "—" } else { &r.source };

    let _ = writeln!(out, "OC Snapshot");
    let _ = writeln!(
        out,
        "Symbol: {}  |  Exp: {}  |  Spot: {}",
        r.symbol,
        expiry,
        price(Some(r.spot))
    );
    let _ = writeln!(
        out,
        "Levels: S1 {}  S2 {}  R1 {}  R2 {}",
        price(r.raw.s1),
        price(r.raw.s2),
        price(r.raw.r1),
        price(r.raw.r2)
    );
    let _ = writeln!(
        out,
        "Shifted: S1* {}  S2* {}  R1* {}  R2* {}",
        price(r.shifted.s1),
        price(r.shifted.s2),
        price(r.shifted.r1),
        price(r.shifted.r2)
    );
    let _ = writeln!(
        out,
        "Buffer: {}  |  MV: {} ({})  |  PCR: {}  |  MP: {}",
        buffer,
        r.view.view,
        r.view.source,
        price(r.pcr),
        price(r.max_pain)
    );
    match r.as_of {
        Some(ts) => {
            let _ = writeln!(
                out,
                "Source: {}  |  As-of: {}  |  Age: {}",
                source,
                local(ts).format("%H:%M:%S"),
                age
            );
        }
        None => {
            let _ = writeln!(out, "Source: {}  |  Age: {}", source, age);
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Checks");
    for c in &r.checks {
        let _ = writeln!(
            out,
            "- {}: {} {}",
            c.id,
            if c.ok { "✅" } else { "❌" },
            c.reason
        );
    }

    let _ = writeln!(out);
    match (r.eligible, r.trigger) {
        (true, Some(t)) => {
            let _ = write!(
                out,
                "Summary: ✅ Eligible — {} @ {} ({:.2})",
                t.side, t.tag, t.price
            );
        }
        _ => {
            let failed: Vec<String> = r.failed().iter().map(|c| c.to_string()).collect();
            let _ = write!(
                out,
                "Summary: ❌ Not eligible — failed: {}",
                if failed.is_empty() {
                    "—".to_string()
                } else {
                    failed.join(", ")
                }
            );
        }
    }
    out
}
