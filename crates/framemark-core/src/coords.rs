//! 图像坐标系
//!
//! 图像坐标以像素为单位，y 轴向下；世界坐标 y 轴向上。
//! 比例尺为每像素对应的世界单位，x/y 方向可以不同。

use crate::error::CoordsError;
use crate::geometry;
use crate::math::{normalize_angle, Point2, Vector2};
use serde::{Deserialize, Serialize};

/// 图像到世界的坐标变换
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoordSystem {
    /// 世界原点在图像中的位置
    pub(crate) origin: Point2,
    /// 世界x轴相对图像x轴的逆时针角度（弧度）
    pub(crate) angle: f64,
    pub(crate) scale_x: f64,
    pub(crate) scale_y: f64,
}

impl Default for CoordSystem {
    fn default() -> Self {
        Self {
            origin: Point2::origin(),
            angle: 0.0,
            scale_x: 1.0,
            scale_y: 1.0,
        }
    }
}

impl CoordSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn origin(&self) -> Point2 {
        self.origin
    }

    pub fn set_origin(&mut self, origin: Point2) {
        self.origin = origin;
    }

    pub fn angle(&self) -> f64 {
        self.angle
    }

    pub fn set_angle(&mut self, angle: f64) {
        self.angle = normalize_angle(angle);
    }

    pub fn scale(&self) -> (f64, f64) {
        (self.scale_x, self.scale_y)
    }

    /// 设置比例尺，必须为有限正数
    pub fn set_scale(&mut self, scale_x: f64, scale_y: f64) -> Result<(), CoordsError> {
        let valid = |s: f64| s.is_finite() && s > 0.0;
        if !valid(scale_x) || !valid(scale_y) {
            return Err(CoordsError::InvalidScale { scale_x, scale_y });
        }
        self.scale_x = scale_x;
        self.scale_y = scale_y;
        Ok(())
    }

    /// 平移、翻转y轴并旋转到世界轴方向（仍为像素单位）
    fn aligned(&self, p: &Point2) -> Point2 {
        let dx = p.x - self.origin.x;
        let dy = self.origin.y - p.y;
        let (sin, cos) = self.angle.sin_cos();
        Point2::new(dx * cos + dy * sin, dy * cos - dx * sin)
    }

    /// 图像坐标 -> 世界坐标
    pub fn image_to_world(&self, p: &Point2) -> Point2 {
        let a = self.aligned(p);
        Point2::new(a.x * self.scale_x, a.y * self.scale_y)
    }

    /// 世界坐标 -> 图像坐标
    pub fn world_to_image(&self, w: &Point2) -> Point2 {
        let u = w.x / self.scale_x;
        let v = w.y / self.scale_y;
        let (sin, cos) = self.angle.sin_cos();
        let dx = u * cos - v * sin;
        let dy = u * sin + v * cos;
        Point2::new(self.origin.x + dx, self.origin.y - dy)
    }

    /// 两个图像点之间的世界向量
    pub fn world_vector(&self, from: &Point2, to: &Point2) -> Vector2 {
        self.image_to_world(to) - self.image_to_world(from)
    }

    /// 世界向量 -> 图像向量
    pub fn world_vector_to_image(&self, v: &Vector2) -> Vector2 {
        self.world_to_image(&Point2::from(*v)) - self.world_to_image(&Point2::origin())
    }

    /// 两个图像点之间的世界距离
    pub fn world_length(&self, p1: &Point2, p2: &Point2) -> f64 {
        geometry::length(&self.aligned(p1), &self.aligned(p2), self.scale_x, self.scale_y)
    }

    /// 图像线段在世界坐标中的方向角
    pub fn world_angle(&self, p1: &Point2, p2: &Point2) -> Option<f64> {
        geometry::line_angle(&self.image_to_world(p1), &self.image_to_world(p2))
    }
}
