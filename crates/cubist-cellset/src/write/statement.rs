//! Procedure statements for single cell writes
//!
//! Each written cell becomes exactly one line of procedure code, so a
//! line number in an error log identifies the cell.

use cubist_common::NameKey;

use crate::dimensions::{ElementKind, MeasureTypes};
use crate::model::{CellValue, Coordinate};
use crate::tokenize::quote_literal;

/// Significant digits kept for numbers without an explicit precision
pub const SIGNIFICANT_DIGITS: i32 = 15;

const ELEMENT_ATTRIBUTES_PREFIX: &str = "}elementattributes_";

/// Render `x` as a procedure numeric literal.
///
/// Without `precision`, rounds to [`SIGNIFICANT_DIGITS`]; otherwise to
/// `precision` decimals. Non-finite values are rejected before this point.
pub fn format_number(x: f64, precision: Option<usize>) -> String {
    if let Some(decimals) = precision {
        return format!("{:.*}", decimals, x);
    }
    if x == 0.0 || !x.is_finite() {
        return "0".to_string();
    }
    let decimals = SIGNIFICANT_DIGITS - x.abs().log10().ceil() as i32;
    let rounded = if decimals >= 0 {
        format!("{:.*}", decimals as usize, x)
            .parse::<f64>()
            .unwrap_or(x)
    } else {
        let scale = 10f64.powi(-decimals);
        (x / scale).round() * scale
    };
    format!("{}", rounded)
}

/// Write behaviour shared by every generated statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatementOptions {
    pub increment: bool,
    /// Spread onto consolidated targets instead of failing
    pub allow_spread: bool,
    /// Guard every write with an updateability check
    pub skip_non_updateable: bool,
    pub precision: Option<usize>,
}

/// Generates write statements for one cube.
#[derive(Debug)]
pub struct StatementBuilder<'a> {
    cube: &'a str,
    dimensions: &'a [String],
    measure_types: &'a MeasureTypes,
    options: StatementOptions,
}

enum Put {
    Numeric(String),
    Text(String),
}

impl<'a> StatementBuilder<'a> {
    pub fn new(
        cube: &'a str,
        dimensions: &'a [String],
        measure_types: &'a MeasureTypes,
        options: StatementOptions,
    ) -> Self {
        Self {
            cube,
            dimensions,
            measure_types,
            options,
        }
    }

    fn measure_kind(&self, coordinate: &Coordinate) -> Option<ElementKind> {
        let measure = coordinate.elements().last()?;
        self.measure_types
            .get(&NameKey::from(measure.as_str()))
            .or_else(|| {
                // hierarchy:element
                let (_, element) = measure.split_once(':')?;
                self.measure_types.get(&NameKey::from(element))
            })
            .copied()
    }

    fn put(&self, coordinate: &Coordinate, value: &CellValue) -> Put {
        let precision = self.options.precision;
        match (self.measure_kind(coordinate), value) {
            (Some(ElementKind::String), CellValue::Number(n)) => {
                Put::Text(format_number(*n, precision))
            }
            (Some(ElementKind::String), CellValue::Text(s)) => Put::Text(s.clone()),
            (Some(ElementKind::String), CellValue::Empty) => Put::Text(String::new()),
            (_, CellValue::Number(n)) => Put::Numeric(format_number(*n, precision)),
            (_, CellValue::Empty) => Put::Numeric("0".to_string()),
            (Some(_), CellValue::Text(s)) => match s.trim().parse::<f64>() {
                Ok(n) if n.is_finite() => Put::Numeric(format_number(n, precision)),
                _ => Put::Text(s.clone()),
            },
            (None, CellValue::Text(s)) => Put::Text(s.clone()),
        }
    }

    fn numeric_function(&self) -> &'static str {
        if self.options.increment
            && !self.cube.to_lowercase().starts_with(ELEMENT_ATTRIBUTES_PREFIX)
        {
            "CellIncrementN"
        } else {
            "CellPutN"
        }
    }

    /// `'cube','e1',...,'en'`
    fn address(&self, coordinate: &Coordinate) -> String {
        std::iter::once(self.cube)
            .chain(coordinate.elements().iter().map(String::as_str))
            .map(quote_literal)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// The statement writing `value` to `coordinate`, on one line.
    pub fn statement(&self, coordinate: &Coordinate, value: &CellValue) -> String {
        let address = self.address(coordinate);
        let write = match self.put(coordinate, value) {
            Put::Text(text) => format!("CellPutS({},{});", quote_literal(&text), address),
            Put::Numeric(number) if self.options.allow_spread => {
                let any_consolidated = self
                    .dimensions
                    .iter()
                    .zip(coordinate.elements())
                    .map(|(d, e)| {
                        format!(
                            "ElementType({},'',{})@='C'",
                            quote_literal(d),
                            quote_literal(e)
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("%");
                format!(
                    "IF({});CellPutProportionalSpread({},{});ELSE;{}({},{});ENDIF;",
                    any_consolidated,
                    number,
                    address,
                    self.numeric_function(),
                    number,
                    address
                )
            }
            Put::Numeric(number) => {
                format!("{}({},{});", self.numeric_function(), number, address)
            }
        };

        if self.options.skip_non_updateable {
            format!("IF(CellIsUpdateable({})=1);{}ENDIF;", address, write)
        } else {
            write
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> Vec<String> {
        vec!["Version".into(), "Period".into(), "Measure".into()]
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(10.0, None), "10");
        assert_eq!(format_number(0.1 + 0.2, None), "0.3");
        assert_eq!(format_number(-2.5, None), "-2.5");
        assert_eq!(format_number(0.0, None), "0");
        assert_eq!(format_number(1.23456, Some(2)), "1.23");
        assert_eq!(format_number(1.0 / 3.0, None), "0.333333333333333");
    }

    #[test]
    fn test_numeric_and_text_puts() {
        let types = MeasureTypes::new();
        let dims = dims();
        let builder = StatementBuilder::new("Sales", &dims, &types, StatementOptions::default());

        let coordinate = Coordinate::from(["Actual", "Jan", "Units"]);
        assert_eq!(
            builder.statement(&coordinate, &CellValue::Number(10.0)),
            "CellPutN(10,'Sales','Actual','Jan','Units');"
        );
        assert_eq!(
            builder.statement(&coordinate, &CellValue::Text("it's".into())),
            "CellPutS('it''s','Sales','Actual','Jan','Units');"
        );
        assert_eq!(
            builder.statement(&coordinate, &CellValue::Empty),
            "CellPutN(0,'Sales','Actual','Jan','Units');"
        );
    }

    #[test]
    fn test_measure_types_decide_put() {
        let types: MeasureTypes = [
            (NameKey::from("Comment"), ElementKind::String),
            (NameKey::from("Units"), ElementKind::Numeric),
        ]
        .into_iter()
        .collect();
        let dims = dims();
        let builder = StatementBuilder::new("Sales", &dims, &types, StatementOptions::default());

        assert_eq!(
            builder.statement(&Coordinate::from(["A", "Jan", "comment"]), &CellValue::Number(3.0)),
            "CellPutS('3','Sales','A','Jan','comment');"
        );
        assert_eq!(
            builder.statement(&Coordinate::from(["A", "Jan", "Units"]), &CellValue::Text("7".into())),
            "CellPutN(7,'Sales','A','Jan','Units');"
        );
        assert_eq!(
            builder.statement(
                &Coordinate::from(["A", "Jan", "Measure:Comment"]),
                &CellValue::Text("x".into())
            ),
            "CellPutS('x','Sales','A','Jan','Measure:Comment');"
        );
    }

    #[test]
    fn test_increment_spread_and_guard() {
        let types = MeasureTypes::new();
        let dims = vec!["Period".to_string(), "Measure".to_string()];
        let options = StatementOptions {
            increment: true,
            allow_spread: true,
            skip_non_updateable: true,
            precision: None,
        };
        let builder = StatementBuilder::new("Sales", &dims, &types, options);
        let statement = builder.statement(&Coordinate::from(["Q1", "Units"]), &CellValue::Number(4.0));
        assert_eq!(
            statement,
            "IF(CellIsUpdateable('Sales','Q1','Units')=1);\
             IF(ElementType('Period','','Q1')@='C'%ElementType('Measure','','Units')@='C');\
             CellPutProportionalSpread(4,'Sales','Q1','Units');\
             ELSE;CellIncrementN(4,'Sales','Q1','Units');ENDIF;\
             ENDIF;"
        );
        assert!(!statement.contains('\n'));
    }

    #[test]
    fn test_attribute_cubes_never_increment() {
        let types = MeasureTypes::new();
        let dims = vec!["Product".to_string(), "}ElementAttributes_Product".to_string()];
        let options = StatementOptions {
            increment: true,
            ..Default::default()
        };
        let builder = StatementBuilder::new("}ElementAttributes_Product", &dims, &types, options);
        assert!(builder
            .statement(&Coordinate::from(["P1", "Weight"]), &CellValue::Number(1.0))
            .starts_with("CellPutN("));
    }
}
