//! 在模型文本中识别代码块，以及把执行结果包装回文本

use crate::session::{CodeExecutionOutput, Content, ExecutableCode, Part};

/// 找到第一个代码块：把内容截断为「代码块之前的文本 + ExecutableCode」，返回代码
///
/// 代码块之后的文本被丢弃，模型需要先看到执行结果再继续。
pub fn extract_code_and_truncate(
    content: &mut Content,
    delimiters: &[(String, String)],
) -> Option<String> {
    let text = content.text()?;

    let (start_idx, start, end) = delimiters
        .iter()
        .filter_map(|(start, end)| text.find(start.as_str()).map(|i| (i, start, end)))
        .min_by_key(|(i, _, _)| *i)?;

    let body_start = start_idx + start.len();
    let body_len = text[body_start..].find(end.as_str())?;
    let code = text[body_start..body_start + body_len].to_string();
    if code.trim().is_empty() {
        return None;
    }

    let prefix = text[..start_idx].to_string();
    let mut parts: Vec<Part> = content
        .parts
        .iter()
        .filter(|p| matches!(p, Part::Text { thought: true, .. }))
        .cloned()
        .collect();
    if !prefix.trim().is_empty() {
        parts.push(Part::text(prefix));
    }
    parts.push(Part::ExecutableCode(ExecutableCode {
        language: "python".to_string(),
        code: code.clone(),
    }));
    content.parts = parts;
    Some(code)
}

/// 把代码重新渲染成带定界符的文本（写入模型历史）
pub fn format_code_block(code: &str, delimiters: &[(String, String)]) -> String {
    match delimiters.first() {
        Some((start, end)) => format!("{start}{code}{end}"),
        None => code.to_string(),
    }
}

/// 执行结果回交模型时的文本形式
pub fn format_execution_result(result: &CodeExecutionOutput, delimiters: &(String, String)) -> String {
    let mut body = if result.is_error() {
        format!("Error:\n{}", result.stderr.trim_end())
    } else {
        format!("Code execution result:\n{}", result.stdout.trim_end())
    };
    if !result.output_files.is_empty() {
        let names: Vec<String> = result.output_files.iter().map(|n| format!("`{n}`")).collect();
        body.push_str(&format!("\nSaved artifacts:\n{}", names.join(",")));
    }
    format!("{}{}{}", delimiters.0, body, delimiters.1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_code_block_delimiters, default_execution_result_delimiters};

    #[test]
    fn test_extracts_first_block_and_truncates() {
        let mut content = Content::model_text(
            "Let me compute.\n```python\nprint(math.factorial(5))\n```\nThe answer follows.",
        );
        let code = extract_code_and_truncate(&mut content, &default_code_block_delimiters()).unwrap();
        assert_eq!(code, "print(math.factorial(5))");
        assert_eq!(content.parts.len(), 2);
        assert_eq!(content.text().as_deref(), Some("Let me compute.\n"));
        assert_eq!(content.executable_code().unwrap().code, code);
    }

    #[test]
    fn test_earliest_delimiter_wins() {
        let mut content = Content::model_text("```tool_code\nprint(1)\n```\n```python\nprint(2)\n```");
        let code = extract_code_and_truncate(&mut content, &default_code_block_delimiters()).unwrap();
        assert_eq!(code, "print(1)");
    }

    #[test]
    fn test_no_block_leaves_content_untouched() {
        let mut content = Content::model_text("just text ```python\nunterminated");
        let before = content.clone();
        assert!(extract_code_and_truncate(&mut content, &default_code_block_delimiters()).is_none());
        assert_eq!(content, before);
    }

    #[test]
    fn test_format_result() {
        let delims = default_execution_result_delimiters();
        let ok = CodeExecutionOutput {
            stdout: "120\n".into(),
            stderr: String::new(),
            exit_code: Some(0),
            output_files: vec!["plot.png".into()],
        };
        assert_eq!(
            format_execution_result(&ok, &delims),
            "```tool_output\nCode execution result:\n120\nSaved artifacts:\n`plot.png`\n```"
        );
        let err = CodeExecutionOutput {
            stdout: String::new(),
            stderr: "NameError: x".into(),
            exit_code: Some(1),
            output_files: vec![],
        };
        assert!(format_execution_result(&err, &delims).contains("Error:\nNameError: x"));
    }
}
