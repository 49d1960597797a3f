use glam::{IVec2, Vec2};

/// An axis-aligned box of integer points. Both corners are inclusive.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Aabb2 {
    pub min: IVec2,
    pub max: IVec2,
}

impl Aabb2 {
    pub fn from_min_and_max(min: IVec2, max: IVec2) -> Self {
        Self { min, max }
    }

    pub fn from_center_and_radius(center: IVec2, radius: i32) -> Self {
        Self::from_min_and_max(center - IVec2::splat(radius), center + IVec2::splat(radius))
    }

    pub fn contains(&self, p: IVec2) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y
    }

    /// Maps both corners by floor division, giving the box of cells that this box overlaps.
    pub fn cells(&self, cell_size: i32) -> Self {
        let div = |p: IVec2| IVec2::new(p.x.div_euclid(cell_size), p.y.div_euclid(cell_size));
        Self::from_min_and_max(div(self.min), div(self.max))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Circle {
    pub center: Vec2,
    pub radius: f32,
}

impl Circle {
    pub fn new(center: Vec2, radius: f32) -> Self {
        Self { center, radius }
    }

    pub fn contains_point(&self, p: Vec2) -> bool {
        self.center.distance_squared(p) <= self.radius * self.radius
    }

    pub fn intersects(&self, other: &Self) -> bool {
        let dist = self.center.distance(other.center);
        dist - other.radius < self.radius
    }

    /// The smallest integer box that contains this circle.
    pub fn aabb(&self) -> Aabb2 {
        let min = (self.center - Vec2::splat(self.radius)).floor();
        let max = (self.center + Vec2::splat(self.radius)).ceil();
        Aabb2::from_min_and_max(min.as_ivec2(), max.as_ivec2())
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
