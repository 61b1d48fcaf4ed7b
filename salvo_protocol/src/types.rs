// Core board types for the salvo protocol.
//
// The board is a fixed 10x10 grid addressed by single decimal digits on the
// wire, so every coordinate component lives in `0..=9`. `Coordinate` orders by
// `(x, y)`, which is the order scan results are reported in. `Direction` is a
// numeric-keypad direction (7 8 9 / 4 _ 6 / 1 2 3) with `y` growing
// downward, so keypad row 1-3 moves toward `y = 9`.

use std::fmt;

/// Smallest valid coordinate component.
pub const BOARD_MIN: u8 = 0;

/// Largest valid coordinate component.
pub const BOARD_MAX: u8 = 9;

/// A cell on the board.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Coordinate {
    pub x: u8,
    pub y: u8,
}

impl Coordinate {
    /// Build a coordinate, returning `None` if either component is off the
    /// board.
    pub fn new(x: u8, y: u8) -> Option<Self> {
        if x <= BOARD_MAX && y <= BOARD_MAX {
            Some(Self { x, y })
        } else {
            None
        }
    }

    /// Parse the two-digit wire form (`"37"` is x=3, y=7).
    pub fn from_digits(payload: &str) -> Option<Self> {
        let mut chars = payload.chars();
        let x = chars.next()?.to_digit(10)?;
        let y = chars.next()?.to_digit(10)?;
        if chars.next().is_some() {
            return None;
        }
        Self::new(x as u8, y as u8)
    }

    /// Chebyshev (king-move) distance: the larger of the two axis deltas.
    pub fn chebyshev_distance(self, other: Self) -> u8 {
        self.x.abs_diff(other.x).max(self.y.abs_diff(other.y))
    }

    /// True if `other` lies inside the square of half-width `radius`
    /// centered on `self`.
    pub fn is_within(self, other: Self, radius: u8) -> bool {
        self.chebyshev_distance(other) <= radius
    }

    /// Move one step in `direction`, clamping each axis to the board.
    pub fn step(self, direction: Direction) -> Self {
        let (dx, dy) = direction.delta();
        Self {
            x: clamp_axis(self.x, dx),
            y: clamp_axis(self.y, dy),
        }
    }
}

fn clamp_axis(value: u8, delta: i8) -> u8 {
    match delta {
        d if d < 0 => value.saturating_sub(1),
        d if d > 0 => value.saturating_add(1).min(BOARD_MAX),
        _ => value,
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.x, self.y)
    }
}

/// Keypad movement direction. `0` and `5` have no meaning and never parse.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    DownLeft,
    Down,
    DownRight,
    Left,
    Right,
    UpLeft,
    Up,
    UpRight,
}

impl Direction {
    /// Map a keypad digit to a direction.
    pub fn from_digit(digit: u8) -> Option<Self> {
        match digit {
            1 => Some(Self::DownLeft),
            2 => Some(Self::Down),
            3 => Some(Self::DownRight),
            4 => Some(Self::Left),
            6 => Some(Self::Right),
            7 => Some(Self::UpLeft),
            8 => Some(Self::Up),
            9 => Some(Self::UpRight),
            _ => None,
        }
    }

    /// The keypad digit for this direction.
    pub fn digit(self) -> u8 {
        match self {
            Self::DownLeft => 1,
            Self::Down => 2,
            Self::DownRight => 3,
            Self::Left => 4,
            Self::Right => 6,
            Self::UpLeft => 7,
            Self::Up => 8,
            Self::UpRight => 9,
        }
    }

    /// Per-axis unit offsets. Diagonals move both axes; 2/8 only move `y`;
    /// 4/6 only move `x`.
    pub fn delta(self) -> (i8, i8) {
        match self {
            Self::DownLeft => (-1, 1),
            Self::Down => (0, 1),
            Self::DownRight => (1, 1),
            Self::Left => (-1, 0),
            Self::Right => (1, 0),
            Self::UpLeft => (-1, -1),
            Self::Up => (0, -1),
            Self::UpRight => (1, -1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinate_rejects_off_board() {
        assert!(Coordinate::new(9, 9).is_some());
        assert!(Coordinate::new(10, 0).is_none());
        assert!(Coordinate::new(0, 10).is_none());
    }

    #[test]
    fn coordinate_from_digits() {
        assert_eq!(Coordinate::from_digits("37"), Coordinate::new(3, 7));
        assert_eq!(Coordinate::from_digits("3"), None);
        assert_eq!(Coordinate::from_digits("3a"), None);
        assert_eq!(Coordinate::from_digits("123"), None);
        assert_eq!(Coordinate::from_digits(""), None);
    }

    #[test]
    fn coordinates_order_by_x_then_y() {
        let mut cells = vec![
            Coordinate { x: 2, y: 1 },
            Coordinate { x: 1, y: 9 },
            Coordinate { x: 1, y: 3 },
        ];
        cells.sort();
        assert_eq!(
            cells,
            vec![
                Coordinate { x: 1, y: 3 },
                Coordinate { x: 1, y: 9 },
                Coordinate { x: 2, y: 1 },
            ]
        );
    }

    #[test]
    fn chebyshev_distance_uses_larger_axis() {
        let a = Coordinate { x: 4, y: 4 };
        assert_eq!(a.chebyshev_distance(Coordinate { x: 5, y: 5 }), 1);
        assert_eq!(a.chebyshev_distance(Coordinate { x: 4, y: 7 }), 3);
        assert!(a.is_within(Coordinate { x: 3, y: 5 }, 1));
        assert!(!a.is_within(Coordinate { x: 2, y: 4 }, 1));
    }

    #[test]
    fn digits_five_and_zero_are_not_directions() {
        assert_eq!(Direction::from_digit(0), None);
        assert_eq!(Direction::from_digit(5), None);
        for digit in [1, 2, 3, 4, 6, 7, 8, 9] {
            assert_eq!(Direction::from_digit(digit).map(Direction::digit), Some(digit));
        }
    }

    #[test]
    fn step_moves_axes_per_keypad() {
        let center = Coordinate { x: 5, y: 5 };
        assert_eq!(center.step(Direction::UpLeft), Coordinate { x: 4, y: 4 });
        assert_eq!(center.step(Direction::Down), Coordinate { x: 5, y: 6 });
        assert_eq!(center.step(Direction::Right), Coordinate { x: 6, y: 5 });
        assert_eq!(center.step(Direction::DownRight), Coordinate { x: 6, y: 6 });
    }

    #[test]
    fn step_clamps_at_every_edge() {
        let mut left = Coordinate { x: 0, y: 4 };
        for _ in 0..3 {
            left = left.step(Direction::Left);
        }
        assert_eq!(left, Coordinate { x: 0, y: 4 });

        let right = Coordinate { x: 9, y: 4 }.step(Direction::Right);
        assert_eq!(right, Coordinate { x: 9, y: 4 });

        let top = Coordinate { x: 3, y: 0 }.step(Direction::Up);
        assert_eq!(top, Coordinate { x: 3, y: 0 });

        let bottom = Coordinate { x: 3, y: 9 }.step(Direction::Down);
        assert_eq!(bottom, Coordinate { x: 3, y: 9 });

        // Diagonal into a corner clamps both axes independently.
        let corner = Coordinate { x: 0, y: 9 }.step(Direction::DownLeft);
        assert_eq!(corner, Coordinate { x: 0, y: 9 });
        let edge = Coordinate { x: 0, y: 5 }.step(Direction::UpLeft);
        assert_eq!(edge, Coordinate { x: 0, y: 4 });
    }
}
