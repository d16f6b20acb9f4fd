//! Instruction text sent alongside the expression image.

pub const ANALYSIS_PROMPT_NAME: &str = "analyze_expression";

/// Renders the analysis instruction with the caller's bindings (already
/// serialized as compact JSON) embedded.
pub fn render_analysis_prompt(bindings_json: &str) -> String {
    format!(
        r#"You have been given an image with some mathematical expressions, equations, or graphical problems, and you need to solve them.
If an expression includes variables (like x, y), substitute their values from the user-assigned dictionary before solving. For example, if x=5 and y=10, then 2x+y = 2*5 + 10 = 20. Interpret expressions like 2x as 2 * x.
Use the PEMDAS rule for solving mathematical expressions. PEMDAS stands for the priority order: Parentheses, Exponents, Multiplication and Division (from left to right), Addition and Subtraction (from left to right).
For example:
Q. 2 + 3 * 4 -> (3 * 4) => 12, 2 + 12 = 14.
Q. 2 + 3 + 5 * 4 - 8 / 2 -> 5 * 4 => 20, 8 / 2 => 4, 2 + 3 => 5, 5 + 20 => 25, 25 - 4 => 21.
YOU CAN HAVE FIVE TYPES OF EXPRESSIONS IN THIS IMAGE:
1. Simple math like 2 + 2: return a LIST of one dict: [{{'expr': '2 + 2', 'result': 4}}]
2. Set of equations like x^2 + 2x + 1 = 0 or 3y + 4x = 0, 5x^2 + 6y + 7 = 12: solve for each variable and return a list of dicts with 'assign': True for each variable, e.g. [{{'expr': 'x', 'result': 2, 'assign': True}}, {{'expr': 'y', 'result': 5, 'assign': True}}]
3. Variable assignments like x = 5: return [{{'expr': 'x', 'result': 5, 'assign': True}}]
4. Graphical math problems or scenes (word problems drawn as pictures, trigonometry, collisions, Pythagoras, ...): describe them, then return [{{'expr': description, 'result': answer}}]
5. Abstract concepts (e.g. patriotism, love, a historical reference): return [{{'expr': description, 'result': concept}}]
Use this dictionary of user-assigned values if needed: {bindings_json}
DO NOT wrap the output in code blocks. ONLY return a valid Python or JSON-style list of dicts. No markdown, no commentary."#
    )
}

#[cfg(test)]
mod tests {
    use super::render_analysis_prompt;

    #[test]
    fn prompt_embeds_bindings_and_output_shapes() {
        let prompt = render_analysis_prompt(r#"{"x":5,"θ":"π"}"#);
        assert!(prompt.contains(r#"user-assigned values if needed: {"x":5,"θ":"π"}"#));
        assert!(prompt.contains("[{'expr': '2 + 2', 'result': 4}]"));
        assert!(prompt.contains("[{'expr': 'x', 'result': 5, 'assign': True}]"));
        assert!(prompt.contains("PEMDAS"));
        assert!(prompt.contains("25 - 4 => 21"));
        assert!(prompt.contains("DO NOT wrap the output in code blocks"));
    }

    #[test]
    fn prompt_lists_all_five_categories() {
        let prompt = render_analysis_prompt("{}");
        for marker in ["1. Simple math", "2. Set of equations", "3. Variable assignments", "4. Graphical", "5. Abstract concepts"] {
            assert!(prompt.contains(marker), "missing {marker}");
        }
    }
}
