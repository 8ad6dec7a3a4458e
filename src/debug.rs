//! Per-frame debug shapes, collected when the `debug` feature is enabled.
//!
//! Without the feature every function here compiles to nothing.

use crate::collision::CollisionRectangle;
use crate::math::Point3d;
#[cfg(feature = "debug")]
use serde_json::{json, Value};

#[cfg(feature = "debug")]
thread_local!(
    static DEBUG_FRAME: std::cell::RefCell<Vec<Value>> = Default::default();
);

#[cfg(feature = "debug")]
fn push(shape: Value) {
    DEBUG_FRAME.with(|frame| frame.borrow_mut().push(shape));
}

/// Records a line segment, such as the axis of an area query.
#[allow(unused)]
pub fn debug_line(name: &str, p1: Point3d, p2: Point3d) {
    #[cfg(feature = "debug")]
    push(json!({
        "type": "line",
        "name": name,
        "p1": [p1.x, p1.y, p1.z],
        "p2": [p2.x, p2.y, p2.z],
    }));
}

/// Records the footprint of a collision rectangle along with its height range.
#[allow(unused)]
pub fn debug_rect(name: &str, rect: &CollisionRectangle) {
    #[cfg(feature = "debug")]
    {
        let corners = rect
            .corners_2d()
            .iter()
            .map(|c| [c.x, c.y])
            .collect::<Vec<_>>();
        let height = rect.height();
        push(json!({
            "type": "rect",
            "name": name,
            "corners": corners,
            "height": [height.min, height.max],
        }));
    }
}

/// Records a point obstacle.
#[allow(unused)]
pub fn debug_point(name: &str, point: Point3d) {
    #[cfg(feature = "debug")]
    push(json!({
        "type": "point",
        "name": name,
        "p": [point.x, point.y, point.z],
    }));
}

/// Takes every shape recorded since the last call.
#[cfg(feature = "debug")]
pub fn take_debug_frame() -> Value {
    Value::Array(DEBUG_FRAME.with(|frame| frame.take()))
}
