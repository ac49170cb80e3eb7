//! nom parser for selector expressions
//!
//! Precedence, lowest first: `|`/`or`, `&`/`and`, `not`, comparisons,
//! `+ -`, `* /`, unary `- ~`, `**` (right associative).

use super::expr::{BinaryOp, Expr, Function, UnaryOp};
use crate::error::{Error, Result};
use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{alpha1, alphanumeric1, char, digit0, digit1, multispace0, one_of},
    combinator::{map, map_opt, map_res, not, opt, recognize, value, verify},
    multi::{fold_many0, many0_count},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};

const KEYWORDS: [&str; 3] = ["and", "or", "not"];

// --- HELPERS ---

fn ws<'a, F, O, E: nom::error::ParseError<&'a str>>(
    inner: F,
) -> impl FnMut(&'a str) -> IResult<&'a str, O, E>
where
    F: FnMut(&'a str) -> IResult<&'a str, O, E>,
{
    delimited(multispace0, inner, multispace0)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0_count(alt((alphanumeric1, tag("_")))),
    ))(input)
}

fn keyword(word: &'static str) -> impl FnMut(&str) -> IResult<&str, &str> {
    move |input| verify(identifier, |s: &str| s == word)(input)
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary(op, Box::new(lhs), Box::new(rhs))
}

// --- ATOMS ---

fn number(input: &str) -> IResult<&str, f64> {
    map_res(
        recognize(tuple((
            alt((
                recognize(pair(digit1, opt(pair(char('.'), digit0)))),
                recognize(pair(char('.'), digit1)),
            )),
            opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
        ))),
        |s: &str| s.parse::<f64>(),
    )(input)
}

fn integer(input: &str) -> IResult<&str, u64> {
    map_res(terminated(digit1, not(one_of(".eE"))), |s: &str| s.parse::<u64>())(input)
}

fn placeholder(input: &str) -> IResult<&str, Expr> {
    map(
        preceded(char('#'), map_res(digit1, |s: &str| s.parse::<usize>())),
        Expr::Clause,
    )(input)
}

fn call(input: &str) -> IResult<&str, Expr> {
    let (input, function) = map_opt(identifier, Function::from_name)(input)?;
    let (input, arg) = delimited(ws(char('(')), expr, char(')'))(input)?;
    Ok((input, Expr::Call(function, Box::new(arg))))
}

fn name(input: &str) -> IResult<&str, Expr> {
    map(
        verify(identifier, |s: &str| !KEYWORDS.contains(&s)),
        |s: &str| Expr::Name(s.to_string()),
    )(input)
}

fn atom(input: &str) -> IResult<&str, Expr> {
    ws(alt((
        map(integer, Expr::Integer),
        map(number, Expr::Number),
        placeholder,
        delimited(char('('), expr, char(')')),
        call,
        name,
    )))(input)
}

// --- OPERATORS ---

fn power(input: &str) -> IResult<&str, Expr> {
    let (input, base) = atom(input)?;
    let (input, exponent) = opt(preceded(ws(tag("**")), unary))(input)?;
    Ok(match exponent {
        Some(e) => (input, binary(BinaryOp::Pow, base, e)),
        None => (input, base),
    })
}

fn unary(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(ws(char('-')), unary), |e| Expr::Unary(UnaryOp::Neg, Box::new(e))),
        map(preceded(ws(char('~')), unary), |e| Expr::Unary(UnaryOp::Not, Box::new(e))),
        preceded(ws(char('+')), unary),
        power,
    ))(input)
}

fn product(input: &str) -> IResult<&str, Expr> {
    let (input, first) = unary(input)?;
    fold_many0(
        pair(
            ws(alt((
                value(BinaryOp::Mul, terminated(char('*'), not(char('*')))),
                value(BinaryOp::Div, char('/')),
            ))),
            unary,
        ),
        move || first.clone(),
        |acc, (op, rhs)| binary(op, acc, rhs),
    )(input)
}

fn sum(input: &str) -> IResult<&str, Expr> {
    let (input, first) = product(input)?;
    fold_many0(
        pair(
            ws(alt((value(BinaryOp::Add, char('+')), value(BinaryOp::Sub, char('-'))))),
            product,
        ),
        move || first.clone(),
        |acc, (op, rhs)| binary(op, acc, rhs),
    )(input)
}

fn comparison(input: &str) -> IResult<&str, Expr> {
    let (input, lhs) = sum(input)?;
    let (input, rhs) = opt(pair(
        ws(alt((
            value(BinaryOp::Le, tag("<=")),
            value(BinaryOp::Ge, tag(">=")),
            value(BinaryOp::Eq, tag("==")),
            value(BinaryOp::Ne, tag("!=")),
            value(BinaryOp::Lt, tag("<")),
            value(BinaryOp::Gt, tag(">")),
        ))),
        sum,
    ))(input)?;
    Ok(match rhs {
        Some((op, rhs)) => (input, binary(op, lhs, rhs)),
        None => (input, lhs),
    })
}

fn negation(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(ws(keyword("not")), negation), |e| {
            Expr::Unary(UnaryOp::Not, Box::new(e))
        }),
        comparison,
    ))(input)
}

fn conjunction(input: &str) -> IResult<&str, Expr> {
    let (input, first) = negation(input)?;
    fold_many0(
        preceded(ws(alt((tag("&"), keyword("and")))), negation),
        move || first.clone(),
        |acc, rhs| binary(BinaryOp::And, acc, rhs),
    )(input)
}

fn expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = conjunction(input)?;
    fold_many0(
        preceded(ws(alt((tag("|"), keyword("or")))), conjunction),
        move || first.clone(),
        |acc, rhs| binary(BinaryOp::Or, acc, rhs),
    )(input)
}

fn near(input: &str) -> String {
    if input.chars().count() > 20 {
        format!("{}...", input.chars().take(20).collect::<String>())
    } else {
        input.to_string()
    }
}

/// Parse a complete expression; names are left unresolved
pub fn parse_expression(text: &str) -> Result<Expr> {
    match expr(text) {
        Ok((rest, e)) if rest.trim().is_empty() => Ok(e),
        Ok((rest, _)) => Err(Error::selector(
            format!("unexpected input near '{}'", near(rest.trim())),
            text,
        )),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(Error::selector(
            format!("invalid syntax near '{}'", near(e.input)),
            text,
        )),
        Err(nom::Err::Incomplete(_)) => Err(Error::selector("incomplete expression", text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Expr {
        Expr::Name(s.to_string())
    }

    #[test]
    fn test_numbers() {
        assert_eq!(parse_expression("42").unwrap(), Expr::Integer(42));
        assert_eq!(parse_expression("42.").unwrap(), Expr::Number(42.0));
        assert_eq!(parse_expression("1e3").unwrap(), Expr::Number(1000.0));
        assert_eq!(
            parse_expression("18446744073709551615").unwrap(),
            Expr::Integer(u64::MAX)
        );
        assert_eq!(parse_expression(" 1.5e3 ").unwrap(), Expr::Number(1500.0));
        assert_eq!(parse_expression(".25").unwrap(), Expr::Number(0.25));
        assert_eq!(
            parse_expression("-1").unwrap(),
            Expr::Unary(UnaryOp::Neg, Box::new(Expr::Integer(1)))
        );
    }

    #[test]
    fn test_precedence() {
        // x + y * 2 > 1
        let expected = binary(
            BinaryOp::Gt,
            binary(
                BinaryOp::Add,
                name("x"),
                binary(BinaryOp::Mul, name("y"), Expr::Integer(2)),
            ),
            Expr::Integer(1),
        );
        assert_eq!(parse_expression("x + y * 2 > 1").unwrap(), expected);

        // -x**2 is -(x**2)
        assert_eq!(
            parse_expression("-x**2").unwrap(),
            Expr::Unary(
                UnaryOp::Neg,
                Box::new(binary(BinaryOp::Pow, name("x"), Expr::Integer(2)))
            )
        );

        // & binds tighter than |
        assert_eq!(
            parse_expression("#0 | #1 & #2").unwrap(),
            binary(
                BinaryOp::Or,
                Expr::Clause(0),
                binary(BinaryOp::And, Expr::Clause(1), Expr::Clause(2))
            )
        );
    }

    #[test]
    fn test_keywords_and_functions() {
        assert_eq!(
            parse_expression("not x>0 and sqrt(px**2)<1").unwrap(),
            binary(
                BinaryOp::And,
                Expr::Unary(
                    UnaryOp::Not,
                    Box::new(binary(BinaryOp::Gt, name("x"), Expr::Integer(0)))
                ),
                binary(
                    BinaryOp::Lt,
                    Expr::Call(
                        Function::Sqrt,
                        Box::new(binary(BinaryOp::Pow, name("px"), Expr::Integer(2)))
                    ),
                    Expr::Integer(1)
                )
            )
        );
        // identifiers that merely start with a keyword
        assert_eq!(parse_expression("order").unwrap(), name("order"));
        assert_eq!(
            parse_expression("(t>=10)&(t<50)").unwrap(),
            binary(
                BinaryOp::And,
                binary(BinaryOp::Ge, name("t"), Expr::Integer(10)),
                binary(BinaryOp::Lt, name("t"), Expr::Integer(50))
            )
        );
    }

    #[test]
    fn test_syntax_errors() {
        for bad in ["", "x >", "(x > 0", "x > 0)", "x $ 1", "1 < x < 2", "and"] {
            match parse_expression(bad) {
                Err(Error::SelectorSyntax { fragment, .. }) => assert_eq!(fragment, bad),
                other => panic!("{:?} parsed as {:?}", bad, other),
            }
        }
    }
}
