use bevy::math::{IVec2, UVec2, Vec2};

/// Walks the quads of a `columns` x `rows` quad grid crossed by a 2D segment.
///
/// The segment is given in grid space, where quad `(x, y)` covers
/// `[x, x + 1] x [y, y + 1]`. It is clipped to the grid first, quads are
/// yielded in order of increasing segment parameter.
pub struct GridTraversal {
    quad: IVec2,
    exit: IVec2,
    step: IVec2,
    t_max: Vec2,
    t_delta: Vec2,
    columns: i32,
    rows: i32,
    remaining: u32,
    done: bool,
}

impl GridTraversal {
    pub fn new(start: Vec2, end: Vec2, columns: u32, rows: u32) -> Self {
        let mut traversal = Self {
            quad: IVec2::ZERO,
            exit: IVec2::ZERO,
            step: IVec2::ZERO,
            t_max: Vec2::INFINITY,
            t_delta: Vec2::INFINITY,
            columns: columns as i32,
            rows: rows as i32,
            remaining: 0,
            done: true,
        };

        if columns == 0 || rows == 0 {
            return traversal;
        }

        let direction = end - start;
        let Some((t_enter, t_exit)) = clip(start, direction, Vec2::new(columns as f32, rows as f32))
        else {
            return traversal;
        };

        traversal.quad = traversal.quad_of(start + direction * t_enter);
        traversal.exit = traversal.quad_of(start + direction * t_exit);
        for axis in 0..2 {
            if direction[axis] > 0.0 {
                traversal.step[axis] = 1;
                traversal.t_max[axis] = ((traversal.quad[axis] + 1) as f32 - start[axis]) / direction[axis];
                traversal.t_delta[axis] = 1.0 / direction[axis];
            } else if direction[axis] < 0.0 {
                traversal.step[axis] = -1;
                traversal.t_max[axis] = (traversal.quad[axis] as f32 - start[axis]) / direction[axis];
                traversal.t_delta[axis] = -1.0 / direction[axis];
            }
        }

        let span = (traversal.exit - traversal.quad).abs();
        traversal.remaining = (span.x + span.y + 1) as u32;
        traversal.done = false;
        traversal
    }

    fn quad_of(&self, point: Vec2) -> IVec2 {
        IVec2::new(
            (point.x.floor() as i32).clamp(0, self.columns - 1),
            (point.y.floor() as i32).clamp(0, self.rows - 1),
        )
    }

    fn in_bounds(&self, quad: IVec2) -> bool {
        quad.x >= 0 && quad.y >= 0 && quad.x < self.columns && quad.y < self.rows
    }
}

/// Liang-Barsky clip of `start + t * direction` against `[0, size]`.
fn clip(start: Vec2, direction: Vec2, size: Vec2) -> Option<(f32, f32)> {
    let mut t_enter = 0.0f32;
    let mut t_exit = 1.0f32;

    let boundaries = [
        (-direction.x, start.x),
        (direction.x, size.x - start.x),
        (-direction.y, start.y),
        (direction.y, size.y - start.y),
    ];

    for (p, q) in boundaries {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
        } else {
            let t = q / p;
            if p < 0.0 {
                if t > t_exit {
                    return None;
                }
                t_enter = t_enter.max(t);
            } else {
                if t < t_enter {
                    return None;
                }
                t_exit = t_exit.min(t);
            }
        }
    }

    Some((t_enter, t_exit))
}

impl Iterator for GridTraversal {
    type Item = UVec2;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let current = self.quad;

        if current == self.exit || self.remaining <= 1 {
            self.done = true;
        } else {
            self.remaining -= 1;

            if self.t_max.x < self.t_max.y {
                self.quad.x += self.step.x;
                self.t_max.x += self.t_delta.x;
            } else {
                self.quad.y += self.step.y;
                self.t_max.y += self.t_delta.y;
            }

            if !self.in_bounds(self.quad) {
                self.done = true;
            }
        }

        Some(current.as_uvec2())
    }
}
