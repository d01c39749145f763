#[derive(Clone, Copy, Debug, Default, PartialEq)]
/// Position in source-image pixel space.
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    fn lerp(self, to: Point, t: f64) -> Point {
        Point {
            x: self.x + (to.x - self.x) * t,
            y: self.y + (to.y - self.y) * t,
        }
    }

    fn distance_sq(self, other: Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Control point label, in declaration order.
pub enum Corner {
    A,
    B,
    C,
    D,
}

impl Corner {
    pub const ALL: [Corner; 4] = [Corner::A, Corner::B, Corner::C, Corner::D];

    pub fn label(self) -> &'static str {
        match self {
            Corner::A => "A",
            Corner::B => "B",
            Corner::C => "C",
            Corner::D => "D",
        }
    }

    /// Placement cycle used by click-to-place editing.
    pub fn next(self) -> Corner {
        match self {
            Corner::A => Corner::B,
            Corner::B => Corner::C,
            Corner::C => Corner::D,
            Corner::D => Corner::A,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
/// Source region to unwarp: top-left, top-right, bottom-right, bottom-left.
///
/// `A -> B` is the `v = 0` edge and `D -> C` the `v = 1` edge. Corners may
/// sit outside the image; samplers clamp.
pub struct Quad {
    pub a: Point,
    pub b: Point,
    pub c: Point,
    pub d: Point,
}

impl Quad {
    pub const fn new(a: Point, b: Point, c: Point, d: Point) -> Self {
        Self { a, b, c, d }
    }

    /// Default selection for a freshly opened image: inset to 25%/75%.
    pub fn centered(width: u32, height: u32) -> Self {
        let w = width as f64;
        let h = height as f64;
        Self {
            a: Point::new(w / 4.0, h / 4.0),
            b: Point::new(w * 3.0 / 4.0, h / 4.0),
            c: Point::new(w * 3.0 / 4.0, h * 3.0 / 4.0),
            d: Point::new(w / 4.0, h * 3.0 / 4.0),
        }
    }

    /// Quad covering the whole image; warping with it is the identity.
    pub fn full_image(width: u32, height: u32) -> Self {
        let w = width as f64;
        let h = height as f64;
        Self {
            a: Point::new(0.0, 0.0),
            b: Point::new(w, 0.0),
            c: Point::new(w, h),
            d: Point::new(0.0, h),
        }
    }

    pub fn corner(&self, corner: Corner) -> Point {
        match corner {
            Corner::A => self.a,
            Corner::B => self.b,
            Corner::C => self.c,
            Corner::D => self.d,
        }
    }

    /// Returns a copy with one corner replaced; the others are untouched.
    pub fn with_corner(self, corner: Corner, point: Point) -> Quad {
        let mut next = self;
        match corner {
            Corner::A => next.a = point,
            Corner::B => next.b = point,
            Corner::C => next.c = point,
            Corner::D => next.d = point,
        }
        next
    }

    pub fn points(&self) -> [Point; 4] {
        [self.a, self.b, self.c, self.d]
    }

    pub fn is_finite(&self) -> bool {
        self.points().iter().all(|p| p.is_finite())
    }

    /// Corner coordinates as `ax, ay, bx, by, cx, cy, dx, dy`.
    pub fn to_uniform(&self) -> [f32; 8] {
        [
            self.a.x as f32,
            self.a.y as f32,
            self.b.x as f32,
            self.b.y as f32,
            self.c.x as f32,
            self.c.y as f32,
            self.d.x as f32,
            self.d.y as f32,
        ]
    }
}

/// Bilinear patch interpolation: `u` sweeps the top/bottom edges, `v` blends
/// between them. No bounds checking.
pub fn bilinear_sample(quad: &Quad, u: f64, v: f64) -> Point {
    let ab = quad.a.lerp(quad.b, u);
    let dc = quad.d.lerp(quad.c, u);
    ab.lerp(dc, v)
}

/// Corner closest to `p`. Ties go to the earliest corner in `A, B, C, D`.
pub fn nearest_control_point(quad: &Quad, p: Point) -> Corner {
    let mut best = Corner::A;
    let mut best_dist = quad.a.distance_sq(p);
    for corner in &Corner::ALL[1..] {
        let dist = quad.corner(*corner).distance_sq(p);
        if dist < best_dist {
            best = *corner;
            best_dist = dist;
        }
    }
    best
}

#[derive(Clone, Copy, Debug, PartialEq)]
/// On-screen rectangle the source image is drawn into.
pub struct ViewportRect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

/// Maps a pointer position in screen units to image pixels, floored.
///
/// Returns `None` when the viewport has no usable extent.
pub fn to_image_space(
    pointer: Point,
    viewport: ViewportRect,
    image_width: u32,
    image_height: u32,
) -> Option<Point> {
    let usable = |extent: f64| extent.is_finite() && extent > 0.0;
    if !usable(viewport.width) || !usable(viewport.height) {
        return None;
    }
    let x = ((pointer.x - viewport.left) / viewport.width * image_width as f64).floor();
    let y = ((pointer.y - viewport.top) / viewport.height * image_height as f64).floor();
    Some(Point::new(x, y))
}
