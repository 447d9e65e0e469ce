//! 几何内核
//!
//! 纯函数，无状态：
//! - 圆拟合（2点、3点、N点）
//! - 线段角度与长度
//! - 量角器夹角
//!
//! 退化输入（共线点、零长度线段）返回哨兵值，不产生 NaN。

use crate::math::{midpoint, normalize_angle, Point2, Vector2};
use serde::{Deserialize, Serialize};

/// 有效圆的最大半径（图像单位）
pub const MAX_RADIUS: f64 = 100_000.0;

/// 共线判定的相对容差
const COLLINEAR_TOLERANCE: f64 = 1e-12;

/// 圆
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Circle {
    pub center: Point2,
    pub radius: f64,
}

impl Circle {
    pub fn new(center: Point2, radius: f64) -> Self {
        Self { center, radius }
    }

    /// 点到圆周的距离（负值表示在圆内）
    pub fn distance_to_point(&self, point: &Point2) -> f64 {
        (point - self.center).norm() - self.radius
    }

    /// 圆周最高点，用作边缘标记位置
    pub fn edge_point(&self) -> Point2 {
        Point2::new(self.center.x, self.center.y + self.radius)
    }
}

/// 圆拟合结果
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CircleFit {
    /// 由3个及以上的点拟合出的有效圆
    Fitted(Circle),
    /// 仅2个点：以中点为圆心的占位圆，只用于显示
    Placeholder(Circle),
    /// 无法确定有限圆（点数不足、共线、半径超限）
    Degenerate,
}

impl CircleFit {
    /// 有效圆；占位圆和退化结果都返回 `None`
    pub fn circle(&self) -> Option<&Circle> {
        match self {
            CircleFit::Fitted(c) => Some(c),
            _ => None,
        }
    }

    /// 任意可绘制的圆（包括占位圆）
    pub fn shape(&self) -> Option<&Circle> {
        match self {
            CircleFit::Fitted(c) | CircleFit::Placeholder(c) => Some(c),
            CircleFit::Degenerate => None,
        }
    }

    pub fn is_degenerate(&self) -> bool {
        matches!(self, CircleFit::Degenerate)
    }
}

/// 由点集拟合圆
///
/// - 少于2个点：`Degenerate`（调用方不应依赖此结果）
/// - 2个点：中点为圆心、半距为半径的占位圆
/// - 3个点：垂直平分线求外心
/// - 4个及以上：闭式最小二乘（Umbach & Jones 修正最小二乘法）
pub fn fit_circle(points: &[Point2]) -> CircleFit {
    match points.len() {
        0 | 1 => CircleFit::Degenerate,
        2 => fit_two(&points[0], &points[1]),
        3 => fit_three(&points[0], &points[1], &points[2]),
        _ => fit_least_squares(points),
    }
}

fn fit_two(p1: &Point2, p2: &Point2) -> CircleFit {
    let radius = (p2 - p1).norm() / 2.0;
    if radius > 0.0 && radius.is_finite() {
        CircleFit::Placeholder(Circle::new(midpoint(p1, p2), radius))
    } else {
        CircleFit::Degenerate
    }
}

fn fit_three(p1: &Point2, p2: &Point2, p3: &Point2) -> CircleFit {
    let x_delta_a = p2.x - p1.x;
    let y_delta_a = p2.y - p1.y;
    let x_delta_b = p3.x - p2.x;
    let y_delta_b = p3.y - p2.y;

    // 两条弦都竖直，或斜率相等
    if (x_delta_a == 0.0 && x_delta_b == 0.0) || chords_collinear(&[*p1, *p2, *p3]) {
        return CircleFit::Degenerate;
    }

    let mid_a = midpoint(p1, p2);
    let mid_b = midpoint(p2, p3);

    let center = if y_delta_a == 0.0 {
        // 弦A水平，其平分线竖直
        let x = mid_a.x;
        let y = if x_delta_b == 0.0 {
            mid_b.y
        } else {
            mid_b.y + (mid_b.x - x) * x_delta_b / y_delta_b
        };
        Point2::new(x, y)
    } else if y_delta_b == 0.0 {
        let x = mid_b.x;
        let y = if x_delta_a == 0.0 {
            mid_a.y
        } else {
            mid_a.y + (mid_a.x - x) * x_delta_a / y_delta_a
        };
        Point2::new(x, y)
    } else if x_delta_a == 0.0 {
        // 弦A竖直，其平分线水平
        let y = mid_a.y;
        let slope_b = y_delta_b / x_delta_b;
        Point2::new(slope_b * (mid_b.y - y) + mid_b.x, y)
    } else if x_delta_b == 0.0 {
        let y = mid_b.y;
        let slope_a = y_delta_a / x_delta_a;
        Point2::new(slope_a * (mid_a.y - y) + mid_a.x, y)
    } else {
        let slope_a = y_delta_a / x_delta_a;
        let slope_b = y_delta_b / x_delta_b;
        let x = (slope_a * slope_b * (mid_a.y - mid_b.y) - slope_a * mid_b.x
            + slope_b * mid_a.x)
            / (slope_b - slope_a);
        let y = mid_a.y - (x - mid_a.x) / slope_a;
        Point2::new(x, y)
    };

    accept(center, (p1 - center).norm())
}

fn fit_least_squares(points: &[Point2]) -> CircleFit {
    if chords_collinear(points) {
        return CircleFit::Degenerate;
    }

    // 以质心为原点累加，减小大坐标下的舍入误差
    let n = points.len() as f64;
    let origin = points.iter().fold(Vector2::zeros(), |acc, p| acc + p.coords) / n;

    let (mut sx, mut sy, mut sx2, mut sy2) = (0.0, 0.0, 0.0, 0.0);
    let (mut sx3, mut sy3, mut sxy, mut sxy2, mut sx2y) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for p in points {
        let x = p.x - origin.x;
        let y = p.y - origin.y;
        sx += x;
        sy += y;
        sx2 += x * x;
        sy2 += y * y;
        sx3 += x * x * x;
        sy3 += y * y * y;
        sxy += x * y;
        sxy2 += x * y * y;
        sx2y += x * x * y;
    }

    let a = n * sx2 - sx * sx;
    let b = n * sxy - sx * sy;
    let c = n * sy2 - sy * sy;
    let d = 0.5 * (n * sxy2 - sx * sy2 + n * sx3 - sx * sx2);
    let e = 0.5 * (n * sx2y - sy * sx2 + n * sy3 - sy * sy2);

    let denom = a * c - b * b;
    if denom == 0.0 || !denom.is_finite() {
        return CircleFit::Degenerate;
    }

    let center = Point2::new(
        (d * c - b * e) / denom + origin.x,
        (a * e - b * d) / denom + origin.y,
    );

    let radius = points.iter().map(|p| (p - center).norm()).sum::<f64>() / n;
    accept(center, radius)
}

/// 相邻点构成的弦是否全部同向（忽略重合点）
fn chords_collinear(points: &[Point2]) -> bool {
    let mut reference: Option<Vector2> = None;
    for pair in points.windows(2) {
        let chord = pair[1] - pair[0];
        if chord.norm_squared() == 0.0 {
            continue;
        }
        match reference {
            None => reference = Some(chord),
            Some(r) => {
                let cross = r.perp(&chord);
                if cross.abs() > COLLINEAR_TOLERANCE * r.norm() * chord.norm() {
                    return false;
                }
            }
        }
    }
    true
}

fn accept(center: Point2, radius: f64) -> CircleFit {
    let finite = center.x.is_finite() && center.y.is_finite() && radius.is_finite();
    if finite && radius > 0.0 && radius <= MAX_RADIUS {
        CircleFit::Fitted(Circle::new(center, radius))
    } else {
        CircleFit::Degenerate
    }
}

/// 线段方向角（弧度），零长度线段返回 `None`
pub fn line_angle(p1: &Point2, p2: &Point2) -> Option<f64> {
    let d = p2 - p1;
    if d.norm_squared() == 0.0 || !d.x.is_finite() || !d.y.is_finite() {
        return None;
    }
    Some(d.y.atan2(d.x))
}

/// 线段长度（世界单位），`scale_x`/`scale_y` 为每像素对应的世界单位
pub fn length(p1: &Point2, p2: &Point2, scale_x: f64, scale_y: f64) -> f64 {
    let dx = (p2.x - p1.x) * scale_x;
    let dy = (p2.y - p1.y) * scale_y;
    (dx * dx + dy * dy).sqrt()
}

/// 从臂1到臂2的有向夹角，归一化到 (-π, π]
pub fn arm_angle(vertex: &Point2, end1: &Point2, end2: &Point2) -> Option<f64> {
    let a1 = line_angle(vertex, end1)?;
    let a2 = line_angle(vertex, end2)?;
    Some(normalize_angle(a2 - a1))
}

/// 将臂端点绕顶点旋转到绝对角度 `theta`，保持臂长
pub fn rotate_arm(vertex: &Point2, end: &Point2, theta: f64) -> Point2 {
    let d = (end - vertex).norm();
    Point2::new(vertex.x + d * theta.cos(), vertex.y + d * theta.sin())
}

/// 各类步骤的派生几何
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum Derived {
    /// 尚未计算或点数不足
    #[default]
    None,
    /// 线段：图像长度与方向角
    Segment { length: f64, angle: Option<f64> },
    /// 圆拟合
    Circle(CircleFit),
    /// 量角器：有向夹角与两臂长度
    Angle {
        angle: Option<f64>,
        arm1: f64,
        arm2: f64,
    },
}

/// 派生字段类别，用于变更通知
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DerivedField {
    Length,
    Angle,
    Circle,
}

impl Derived {
    /// 该派生结果包含的字段
    pub fn fields(&self) -> &'static [DerivedField] {
        match self {
            Derived::None => &[],
            Derived::Segment { .. } => &[DerivedField::Length, DerivedField::Angle],
            Derived::Circle(_) => &[DerivedField::Circle],
            Derived::Angle { .. } => &[DerivedField::Angle, DerivedField::Length],
        }
    }

    pub fn circle_fit(&self) -> Option<&CircleFit> {
        match self {
            Derived::Circle(fit) => Some(fit),
            _ => None,
        }
    }

    pub fn angle(&self) -> Option<f64> {
        match self {
            Derived::Segment { angle, .. } | Derived::Angle { angle, .. } => *angle,
            _ => None,
        }
    }

    pub fn length(&self) -> Option<f64> {
        match self {
            Derived::Segment { length, .. } => Some(*length),
            _ => None,
        }
    }
}

/// 派生几何刷新函数
pub type RefreshFn = fn(&[Point2]) -> Derived;

/// 两点线段（标定、卷尺、矢量）
pub fn refresh_segment(points: &[Point2]) -> Derived {
    match points {
        [p1, p2, ..] => Derived::Segment {
            length: (p2 - p1).norm(),
            angle: line_angle(p1, p2),
        },
        _ => Derived::None,
    }
}

/// 圆周上的点（圆规、拟合圆）
pub fn refresh_circle(points: &[Point2]) -> Derived {
    Derived::Circle(fit_circle(points))
}

/// 顶点加两臂（量角器）
pub fn refresh_angle(points: &[Point2]) -> Derived {
    match points {
        [vertex, end1, end2, ..] => Derived::Angle {
            angle: arm_angle(vertex, end1, end2),
            arm1: (end1 - vertex).norm(),
            arm2: (end2 - vertex).norm(),
        },
        _ => Derived::None,
    }
}
